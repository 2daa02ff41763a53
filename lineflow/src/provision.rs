//! Destination stream provisioning.
//!
//! Every configured measurement gets a versioned key-value stream: one
//! `string` column per primary-key tag, then the tag and field maps and
//! the timestamps. Rows sharing a primary key collapse to the one with the
//! highest `timestamp`, which makes resubmitting a batch harmless.

use crate::error::Result;
use crate::schema::{
    DISPLAY_TIMESTAMP_COLUMN, FIELDS_COLUMN, StreamConfig, TAGS_COLUMN, TIMESTAMP_COLUMN,
};
use crate::store::StoreControl;

/// Wraps an identifier in backquotes.
///
/// Stream and key names are validated to contain no backquote, so no
/// escaping is needed.
pub fn quote_ident(name: &str) -> String {
    format!("`{name}`")
}

/// `DROP STREAM IF EXISTS` for one stream.
pub fn drop_statement(stream: &str) -> String {
    format!("DROP STREAM IF EXISTS {}", quote_ident(stream))
}

/// `CREATE STREAM` for one stream keyed by `primary_key`.
pub fn create_statement(stream: &str, primary_key: &[String]) -> String {
    let mut columns: Vec<String> = primary_key
        .iter()
        .map(|key| format!("{} string", quote_ident(key)))
        .collect();
    columns.push(format!("{} map(string, string)", quote_ident(TAGS_COLUMN)));
    columns.push(format!("{} map(string, string)", quote_ident(FIELDS_COLUMN)));
    columns.push(format!("{} int64", quote_ident(TIMESTAMP_COLUMN)));
    columns.push(format!(
        "{} datetime64(9, 'UTC')",
        quote_ident(DISPLAY_TIMESTAMP_COLUMN)
    ));

    let key: Vec<String> = primary_key.iter().map(|k| quote_ident(k)).collect();

    format!(
        "CREATE STREAM {} ({}) PRIMARY KEY ({}) SETTINGS mode = 'versioned_kv', version_column = '{TIMESTAMP_COLUMN}'",
        quote_ident(stream),
        columns.join(", "),
        key.join(", "),
    )
}

/// Drops and recreates every configured stream, in measurement order.
///
/// Returns the number of streams created.
///
/// # Errors
///
/// Returns the first statement failure; streams after it are left
/// untouched.
pub fn recreate_streams<C: StoreControl + ?Sized>(
    control: &C,
    streams: &StreamConfig,
) -> Result<usize> {
    let mut created = 0;
    for (stream, primary_key) in streams.streams() {
        control.execute(&drop_statement(stream))?;
        control.execute(&create_statement(stream, primary_key))?;
        tracing::info!("provisioned stream '{stream}' keyed by {primary_key:?}");
        created += 1;
    }
    Ok(created)
}
