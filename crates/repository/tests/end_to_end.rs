use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};

use batchrepo_core::{
    BatchStatus, ExecutionContext, ExitStatus, JobExecution, JobExecutionId, JobInstanceId, JobParameters,
    StepExecutionId,
};
use batchrepo_repository::{ContextOwner, JobExplorer, JobRepository, RepositoryConfig, RepositoryError};
use batchrepo_store::InMemoryDocumentStore;

type Repository = JobRepository<Arc<InMemoryDocumentStore>>;

fn repository() -> Result<(Arc<InMemoryDocumentStore>, Repository)> {
    batchrepo_observability::init_for_tests();
    let backend = Arc::new(InMemoryDocumentStore::new());
    let repository = JobRepository::builder(backend.clone()).build()?;
    Ok((backend, repository))
}

#[test]
fn launch_update_and_stale_update() -> Result<()> {
    let (_, repository) = repository()?;
    let params = JobParameters::new();

    let instance = repository.job_instances().create("job1", &params)?;
    assert_eq!(instance.id, JobInstanceId::new(1));

    let mut execution = JobExecution::new(instance.id, params.clone());
    repository.job_executions().save(&mut execution)?;
    assert_eq!(execution.id, Some(JobExecutionId::new(1)));
    assert_eq!(execution.version, Some(0));

    let mut stale = execution.clone();
    execution.status = BatchStatus::Completed;
    repository.job_executions().update(&mut execution)?;
    assert_eq!(execution.version, Some(1));

    let err = repository.job_executions().update(&mut stale).unwrap_err();
    match err {
        RepositoryError::OptimisticLock { attempted, current, .. } => {
            assert_eq!(attempted, 0);
            assert_eq!(current, 1);
        }
        other => panic!("expected optimistic lock conflict, got {other}"),
    }

    let stored = repository
        .job_executions()
        .get(JobExecutionId::new(1))?
        .expect("execution was saved");
    assert_eq!(stored.status, BatchStatus::Completed);
    Ok(())
}

#[test]
fn duplicate_instance_is_rejected_regardless_of_parameter_order() -> Result<()> {
    let (_, repository) = repository()?;
    let first = JobParameters::new()
        .with_string("a", "1", true)
        .with_long("b", 2, true);
    let second = JobParameters::new()
        .with_long("b", 2, true)
        .with_string("a", "1", true);

    repository.create_job_instance("job", &first)?;
    assert!(matches!(
        repository.create_job_instance("job", &second),
        Err(RepositoryError::DuplicateInstance { .. })
    ));
    // Same key under another job name is a different instance.
    repository.create_job_instance("other", &second)?;
    Ok(())
}

#[test]
fn look_alike_parameter_sets_are_distinct_instances() -> Result<()> {
    let (_, repository) = repository()?;

    let packed = JobParameters::new().with_string("a", "b;c=d", true);
    let split = JobParameters::new()
        .with_string("a", "b", true)
        .with_string("c", "d", true);
    let first = repository.create_job_instance("job", &packed)?;
    let second = repository.create_job_instance("job", &split)?;
    assert_ne!(first.id, second.id);

    let long = JobParameters::new().with_long("n", 5, true);
    let string = JobParameters::new().with_string("n", "5", true);
    repository.create_job_instance("job", &long)?;
    repository.create_job_instance("job", &string)?;

    assert_eq!(repository.job_instances().count("job")?, 4);
    assert_eq!(
        repository.job_instances().get_by_parameters("job", &split)?.map(|i| i.id),
        Some(second.id)
    );
    Ok(())
}

#[test]
fn execution_round_trips_through_the_explorer() -> Result<()> {
    let (backend, repository) = repository()?;
    let params = JobParameters::new()
        .with_string("file", "orders.csv", true)
        .with_long("chunk", 500, false)
        .with_double("threshold", 0.75, false)
        .with_date("business_day", Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap(), true);

    let mut execution = repository.create_job_execution("orders", &params)?;
    execution.status = BatchStatus::Completed;
    execution.start_time = Some(Utc::now());
    execution.end_time = Some(Utc::now() + Duration::seconds(3));
    execution.exit_status = ExitStatus::with_description(ExitStatus::COMPLETED, "all rows loaded");
    repository.update_job_execution(&mut execution)?;

    let explorer = JobExplorer::new(backend, &RepositoryConfig::default())?;
    let view = explorer
        .get_job_execution(execution.id.unwrap())?
        .expect("execution was saved");
    assert_eq!(view.instance.job_name, "orders");
    assert_eq!(view.execution, execution);
    Ok(())
}

#[test]
fn get_last_refuses_to_pick_between_equal_creation_times() -> Result<()> {
    let (_, repository) = repository()?;
    let instance = repository.create_job_instance("job", &JobParameters::new())?;
    let at = Utc::now();
    for _ in 0..2 {
        let mut execution = JobExecution::new(instance.id, JobParameters::new());
        execution.create_time = at;
        repository.job_executions().save(&mut execution)?;
    }

    assert!(matches!(
        repository.job_executions().get_last(instance.id),
        Err(RepositoryError::Integrity(_))
    ));
    Ok(())
}

#[test]
fn find_running_filters_by_job_and_end_time() -> Result<()> {
    let (_, repository) = repository()?;
    let job = repository.create_job_instance("job", &JobParameters::new().with_long("run", 1, true))?;
    let other = repository.create_job_instance("other", &JobParameters::new())?;

    let mut ids = Vec::new();
    for ended in [false, true, false] {
        let mut execution = JobExecution::new(job.id, JobParameters::new());
        if ended {
            execution.start_time = Some(Utc::now());
            execution.end_time = execution.start_time;
        }
        repository.job_executions().save(&mut execution)?;
        ids.push(execution.id);
    }
    repository
        .job_executions()
        .save(&mut JobExecution::new(other.id, JobParameters::new()))?;

    let running: Vec<_> = repository
        .job_executions()
        .find_running("job")?
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(running, vec![ids[2], ids[0]]);
    Ok(())
}

#[test]
fn contexts_round_trip_independent_of_insertion_order() -> Result<()> {
    let (_, repository) = repository()?;
    let contexts = repository.execution_contexts();
    let forward = ContextOwner::StepExecution(StepExecutionId::new(1));
    let backward = ContextOwner::StepExecution(StepExecutionId::new(2));

    let entries = [("a", 1i64), ("b", 2), ("c", 3)];
    let mut ctx_forward = ExecutionContext::new();
    for (k, v) in entries {
        ctx_forward.put(k, v);
    }
    let mut ctx_backward = ExecutionContext::new();
    for (k, v) in entries.iter().rev() {
        ctx_backward.put(*k, *v);
    }
    ctx_forward.put("when", Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 0).unwrap());
    ctx_backward.put("when", Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 0).unwrap());

    contexts.save(forward, &ctx_forward)?;
    contexts.save(backward, &ctx_backward)?;
    assert_eq!(contexts.get(forward)?, contexts.get(backward)?);
    assert_eq!(contexts.get(forward)?, ctx_forward);
    Ok(())
}

#[test]
fn exit_descriptions_are_truncated_on_write_only() -> Result<()> {
    batchrepo_observability::init_for_tests();
    let backend = Arc::new(InMemoryDocumentStore::new());
    let repository = JobRepository::builder(backend)
        .max_exit_message_length(20)
        .build()?;

    let mut execution = repository.create_job_execution("job", &JobParameters::new())?;
    let mut step = execution.new_step_execution("load")?;
    step.exit_status = ExitStatus::with_description(ExitStatus::FAILED, "x".repeat(50));
    repository.add_step_execution(&mut step)?;
    assert_eq!(step.exit_status.exit_description.len(), 50);

    execution.exit_status = ExitStatus::with_description(ExitStatus::FAILED, "y".repeat(50));
    repository.update_job_execution(&mut execution)?;
    assert_eq!(execution.exit_status.exit_description.len(), 50);

    let explorer = repository.explorer();
    let view = explorer
        .get_job_execution(execution.id.unwrap())?
        .expect("execution was saved");
    assert_eq!(view.execution.exit_status.exit_description, "y".repeat(20));
    assert_eq!(
        view.execution.step_executions[0].exit_status.exit_description,
        "x".repeat(20)
    );
    Ok(())
}

#[test]
fn stopped_execution_is_observed_by_a_stale_holder() -> Result<()> {
    let (_, repository) = repository()?;
    let mut runner = repository.create_job_execution("job", &JobParameters::new())?;
    let mut operator = runner.clone();

    operator.status = BatchStatus::Stopping;
    repository.update_job_execution(&mut operator)?;

    runner.status = BatchStatus::Started;
    let conflict = repository.update_job_execution(&mut runner).unwrap_err();
    assert!(conflict.is_optimistic_lock());

    repository.synchronize_status(&mut runner)?;
    assert_eq!(runner.status, BatchStatus::Stopping);
    repository.update_job_execution(&mut runner)?;
    assert_eq!(runner.version, Some(2));
    Ok(())
}
