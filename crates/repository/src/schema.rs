//! Persisted layout: collection suffixes and field names.
//!
//! Field names are shared with existing databases and must not change. That
//! includes the misspelled `filterCout` and `processSkipCout` counters.

use chrono::{DateTime, Utc};
use serde_json::Value;

use batchrepo_store::datetime_value;

// Collection suffixes, appended to the configured prefix.
pub const JOB_INSTANCE_COLLECTION: &str = "JobInstance";
pub const JOB_EXECUTION_COLLECTION: &str = "JobExecution";
pub const JOB_PARAMETER_COLLECTION: &str = "JobParameter";
pub const STEP_EXECUTION_COLLECTION: &str = "StepExecution";
pub const EXECUTION_CONTEXT_COLLECTION: &str = "ExecutionContext";
pub const SEQUENCE_COLLECTION: &str = "Sequence";

// Sequence names, one counter document each.
pub const JOB_INSTANCE_SEQUENCE: &str = "JobInstance";
pub const JOB_EXECUTION_SEQUENCE: &str = "JobExecution";
pub const STEP_EXECUTION_SEQUENCE: &str = "StepExecution";
pub const SEQUENCE_VALUE: &str = "value";

// Shared keys.
pub const JOB_INSTANCE_ID: &str = "jobInstanceId";
pub const JOB_EXECUTION_ID: &str = "jobExecutionId";
pub const STEP_EXECUTION_ID: &str = "stepExecutionId";
pub const VERSION: &str = "version";
pub const STATUS: &str = "status";
pub const START_TIME: &str = "startTime";
pub const END_TIME: &str = "endTime";
pub const EXIT_CODE: &str = "exitCode";
pub const EXIT_MESSAGE: &str = "exitMessage";
pub const LAST_UPDATED: &str = "lastUpdated";

// Job instance.
pub const JOB_NAME: &str = "jobName";
pub const JOB_KEY: &str = "jobKey";

// Job execution.
pub const CREATE_TIME: &str = "createTime";

// Job parameter.
pub const KEY_NAME: &str = "keyName";
pub const TYPE_CD: &str = "type";
pub const STRING_VAL: &str = "stringVal";
pub const LONG_VAL: &str = "longVal";
pub const DOUBLE_VAL: &str = "doubleVal";
pub const DATE_VAL: &str = "dateVal";
pub const IDENTIFYING: &str = "identifying";
pub const IDENTIFYING_YES: &str = "Y";
pub const IDENTIFYING_NO: &str = "N";

// Step execution.
pub const STEP_NAME: &str = "stepName";
pub const COMMIT_COUNT: &str = "commitCount";
pub const READ_COUNT: &str = "readCount";
pub const FILTER_COUNT: &str = "filterCout";
pub const WRITE_COUNT: &str = "writeCount";
pub const READ_SKIP_COUNT: &str = "readSkipCount";
pub const WRITE_SKIP_COUNT: &str = "writeSkipCount";
pub const PROCESS_SKIP_COUNT: &str = "processSkipCout";
pub const ROLLBACK_COUNT: &str = "rollbackCount";

// Execution context.
pub const SERIALIZED_CONTEXT: &str = "serializedContext";

/// Optional timestamps are stored as `null` when unset.
pub fn opt_datetime_value(at: Option<DateTime<Utc>>) -> Value {
    at.as_ref().map(datetime_value).unwrap_or(Value::Null)
}
