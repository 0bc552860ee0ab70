//! Durable schema for the outbox and inbox tables.
//!
//! Statements are idempotent so startup can run them unconditionally. The
//! insert trigger feeds the optional LISTEN/NOTIFY wake path; its payload
//! is empty and ignored by listeners.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS outbox (
        id BIGSERIAL PRIMARY KEY,
        tracking_id UUID NOT NULL UNIQUE,
        aggregate_id TEXT NOT NULL,
        aggregate_type TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        status TEXT NOT NULL DEFAULT 'PENDING'
            CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETED', 'FAILED', 'DEAD_LETTER')),
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        max_retries INTEGER NOT NULL DEFAULT 5 CHECK (max_retries >= 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_at TIMESTAMPTZ,
        visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        locked_until TIMESTAMPTZ,
        lock_token BIGINT,
        last_error TEXT,
        CHECK ((status = 'PROCESSING') = (lock_token IS NOT NULL)),
        CHECK ((locked_until IS NULL) = (lock_token IS NULL))
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_outbox_ready
    ON outbox (status, created_at)
    WHERE status IN ('PENDING', 'FAILED')
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_outbox_lease
    ON outbox (locked_until)
    WHERE status = 'PROCESSING'
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_outbox_aggregate
    ON outbox (aggregate_id, created_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS inbox (
        id BIGSERIAL PRIMARY KEY,
        tracking_id UUID NOT NULL,
        consumer_id TEXT NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (tracking_id, consumer_id)
    )
    ",
    r"
    CREATE OR REPLACE FUNCTION outbox_notify() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify('outbox_changed', '');
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    ",
    "DROP TRIGGER IF EXISTS outbox_notify_insert ON outbox",
    r"
    CREATE TRIGGER outbox_notify_insert
    AFTER INSERT ON outbox
    FOR EACH STATEMENT EXECUTE FUNCTION outbox_notify()
    ",
];

/// Installs (or verifies) the outbox schema on the given pool.
///
/// # Errors
///
/// Returns error if any DDL statement fails.
pub async fn install(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
