//! redb table definitions for the embedded store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Task keys are `{job_id}:{instance_idx}`.

use redb::TableDefinition;

/// Job specs keyed by job id.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Job runtimes keyed by job id.
pub const JOB_RUNTIMES: TableDefinition<&str, &[u8]> = TableDefinition::new("job_runtimes");

/// Task runtimes keyed by `{job_id}:{instance_idx}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Resource-pool specs keyed by pool id.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_pools");

/// Framework registration info, keyed by field name.
pub const FRAMEWORK: TableDefinition<&str, &[u8]> = TableDefinition::new("framework");

/// Persistent volumes keyed by volume id.
pub const VOLUMES: TableDefinition<&str, &[u8]> = TableDefinition::new("volumes");

/// Job-update progress keyed by update id.
pub const UPDATES: TableDefinition<&str, &[u8]> = TableDefinition::new("updates");
