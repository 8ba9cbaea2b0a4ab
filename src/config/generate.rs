pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# CDCSINK CONFIGURATION
# =============================================================================
# Replicates a relational change log (row changes plus DDL) into a DuckDB file
# with merge-on-read semantics: every row version is kept with a `_version`
# stamp and readers take the highest version per primary key.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/cdcsink/config.yml
#   3. /etc/cdcsink/config.yml
#
# Any value may reference environment variables as $env{NAME}.

# =============================================================================
# SOURCE
# =============================================================================
# A JSON-lines change log. Each line is one of:
#   {"kind":"change","table":{"schema":"shop","name":"orders"},"op":"u",
#    "after":{...},"before":{...},"ts_ms":1700000000000}
#   {"kind":"ddl","database":"shop","statement":"ALTER TABLE orders ADD note TEXT"}
# `op` accepts insert/update/delete/snapshot-read or the codes c/u/d/r.

source:
  type: file
  path: /var/lib/cdcsink/changes.jsonl
  # Keep polling for new lines at end of file
  follow: true
  poll_interval: 200ms
  # Used only when no checkpoint exists yet:
  #   initial      replay the whole log
  #   schema_only  replay DDL history, skip historic rows, then stream live
  snapshot_mode: initial
  # Schema for DDL statements that do not qualify table names
  database: app
  # Restrict replication, e.g. ["app.orders", "audit.*"]. Empty = everything.
  include_tables: []

# =============================================================================
# TARGET
# =============================================================================

target:
  path: ~/.local/share/cdcsink/target.duckdb

# =============================================================================
# BATCHING
# =============================================================================
# A table's buffer is flushed when any limit is reached, or before a DDL
# statement for that table is applied.

batch:
  max_rows: 100000
  max_bytes: 67108864
  max_latency: 1s
  # Rows a table may hold (including rows being flushed) before new rows
  # are parked for that table
  max_buffered_rows: 500000
  # Rows parked behind a full buffer before ingestion blocks
  max_parked_rows: 500000
  check_interval: 100ms

# =============================================================================
# WRITER
# =============================================================================

writer:
  # Attempts per batch for transient errors, with exponential backoff
  max_attempts: 5
  initial_backoff: 100ms
  max_backoff: 10s
  # When retries are exhausted:
  #   halt      stop the table and keep its rows unacknowledged
  #   rebuffer  put the batch back and try again after rebuffer_delay
  on_failure: halt
  rebuffer_delay: 5s

# =============================================================================
# SCHEMA DRIFT
# =============================================================================
# Rows that reference columns the registry does not know yet wait for the
# next DDL on their table.

schema:
  max_retries: 3
  max_pending_events: 10000

# =============================================================================
# PIPELINE
# =============================================================================

pipeline:
  # How long in-flight flushes may run after a shutdown request
  shutdown_timeout: 30s

# =============================================================================
# ADMIN API (optional)
# =============================================================================

web:
  listen: 127.0.0.1:7171
"#
    .to_string()
}
