//! Notify trigger installation. Each in-scope table gets a row-level
//! trigger for INSERT/UPDATE/DELETE and a statement-level trigger for
//! TRUNCATE, all dispatching to one shared `table_notify()` function that
//! reads the `_view` manifest and notifies on the database-name channel.

use anyhow::Result;
use sqlx::PgPool;
use std::collections::BTreeSet;
use tracing::debug;

use crate::constants::{MATERIALIZED_VIEW, TRIGGER_FUNC};
use crate::query::sql::quote_ident;

/// The shared trigger function. Projects rows to primary-key and
/// foreign-key columns, gates UPDATEs on the manifest's watched column
/// list, and emits one JSON payload per row change via `PG_NOTIFY`.
pub fn create_function_sql(schema: &str) -> String {
    let view = format!("{}.{}", quote_ident(schema), quote_ident(MATERIALIZED_VIEW));
    let function = format!("{}.{}", quote_ident(schema), quote_ident(TRIGGER_FUNC));
    format!(
        r#"
CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $$
DECLARE
  channel TEXT;
  old_row JSON;
  new_row JSON;
  notification JSON;
  xmin BIGINT;
  _indices TEXT [];
  _primary_keys TEXT [];
  _foreign_keys TEXT [];
  _columns TEXT [];
  _changed BOOLEAN;

BEGIN
    -- database is also the channel name.
    channel := CURRENT_DATABASE();

    IF TG_OP = 'DELETE' THEN

        SELECT primary_keys INTO _primary_keys
        FROM {view}
        WHERE table_name = TG_TABLE_NAME;

        old_row = ROW_TO_JSON(OLD);
        old_row := (
            SELECT JSONB_OBJECT_AGG(key, value)
            FROM JSON_EACH(old_row)
            WHERE key = ANY(_primary_keys)
        );
        xmin := OLD.xmin;
    ELSE
        IF TG_OP <> 'TRUNCATE' THEN

            SELECT primary_keys, foreign_keys, indices, columns
            INTO _primary_keys, _foreign_keys, _indices, _columns
            FROM {view}
            WHERE table_name = TG_TABLE_NAME;

            _columns := COALESCE(_columns, ARRAY[]::TEXT[]);

            -- Only react if any of the listed columns actually changed
            IF TG_OP = 'UPDATE' THEN
                SELECT EXISTS (
                    SELECT 1
                    FROM JSONB_EACH(TO_JSONB(NEW.*)) n
                    JOIN JSONB_EACH(TO_JSONB(OLD.*)) o USING (key)
                    WHERE n.key = ANY(_columns)
                    AND n.value IS DISTINCT FROM o.value
                )
                INTO _changed;

                IF NOT _changed THEN
                    RETURN NEW;
                END IF;
            END IF;

            new_row = ROW_TO_JSON(NEW);
            new_row := (
                SELECT JSONB_OBJECT_AGG(key, value)
                FROM JSON_EACH(new_row)
                WHERE key = ANY(_primary_keys || _foreign_keys)
            );
            IF TG_OP = 'UPDATE' THEN
                old_row = ROW_TO_JSON(OLD);
                old_row := (
                    SELECT JSONB_OBJECT_AGG(key, value)
                    FROM JSON_EACH(old_row)
                    WHERE key = ANY(_primary_keys || _foreign_keys)
                );
            END IF;
            xmin := NEW.xmin;
        END IF;
    END IF;

    notification = JSON_BUILD_OBJECT(
        'xmin', xmin,
        'new', new_row,
        'old', old_row,
        'indices', _indices,
        'tg_op', TG_OP,
        'table', TG_TABLE_NAME,
        'schema', TG_TABLE_SCHEMA
    );

    -- Notify/Listen updates occur asynchronously,
    -- so this doesn't block the trigger procedure.
    PERFORM PG_NOTIFY(channel, notification::TEXT);

  RETURN NEW;
END;
$$ LANGUAGE plpgsql;
"#
    )
}

pub async fn create_function(pool: &PgPool, schema: &str) -> Result<()> {
    sqlx::raw_sql(&create_function_sql(schema)).execute(pool).await?;
    Ok(())
}

pub async fn drop_function(pool: &PgPool, schema: &str) -> Result<()> {
    let sql = format!(
        "DROP FUNCTION IF EXISTS {}.{}() CASCADE",
        quote_ident(schema),
        quote_ident(TRIGGER_FUNC)
    );
    sqlx::raw_sql(&sql).execute(pool).await?;
    Ok(())
}

/// Install the notify and truncate triggers on every given table.
pub async fn create_triggers(
    pool: &PgPool,
    schema: &str,
    tables: &BTreeSet<String>,
) -> Result<()> {
    for table in tables {
        debug!(schema, table, "creating triggers");
        drop_table_triggers(pool, schema, table).await?;
        let row_trigger = format!(
            "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {}.{} \
             FOR EACH ROW EXECUTE PROCEDURE {}.{}()",
            quote_ident(&format!("{table}_notify")),
            quote_ident(schema),
            quote_ident(table),
            quote_ident(schema),
            quote_ident(TRIGGER_FUNC),
        );
        let truncate_trigger = format!(
            "CREATE TRIGGER {} AFTER TRUNCATE ON {}.{} \
             FOR EACH STATEMENT EXECUTE PROCEDURE {}.{}()",
            quote_ident(&format!("{table}_truncate")),
            quote_ident(schema),
            quote_ident(table),
            quote_ident(schema),
            quote_ident(TRIGGER_FUNC),
        );
        sqlx::raw_sql(&row_trigger).execute(pool).await?;
        sqlx::raw_sql(&truncate_trigger).execute(pool).await?;
    }
    Ok(())
}

pub async fn drop_triggers(pool: &PgPool, schema: &str, tables: &BTreeSet<String>) -> Result<()> {
    for table in tables {
        debug!(schema, table, "dropping triggers");
        drop_table_triggers(pool, schema, table).await?;
    }
    Ok(())
}

async fn drop_table_triggers(pool: &PgPool, schema: &str, table: &str) -> Result<()> {
    for suffix in ["notify", "truncate"] {
        let sql = format!(
            "DROP TRIGGER IF EXISTS {} ON {}.{}",
            quote_ident(&format!("{table}_{suffix}")),
            quote_ident(schema),
            quote_ident(table),
        );
        sqlx::raw_sql(&sql).execute(pool).await?;
    }
    Ok(())
}

/// The ALTER statements toggling one table's installed triggers.
pub fn toggle_trigger_sql(schema: &str, table: &str, enabled: bool) -> Vec<String> {
    let action = if enabled { "ENABLE" } else { "DISABLE" };
    ["notify", "truncate"]
        .iter()
        .map(|suffix| {
            format!(
                "ALTER TABLE {}.{} {} TRIGGER {}",
                quote_ident(schema),
                quote_ident(table),
                action,
                quote_ident(&format!("{table}_{suffix}")),
            )
        })
        .collect()
}

/// Toggle the installed triggers, e.g. around bulk seed loads.
pub async fn set_triggers_enabled(
    pool: &PgPool,
    schema: &str,
    tables: &BTreeSet<String>,
    enabled: bool,
) -> Result<()> {
    for table in tables {
        for sql in toggle_trigger_sql(schema, table, enabled) {
            sqlx::raw_sql(&sql).execute(pool).await?;
        }
    }
    Ok(())
}
