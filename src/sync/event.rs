//! Change events: the JSON payload emitted by the notify trigger and the
//! parsed form of logical-decoding lines. `old`/`new` carry only the
//! primary-key and foreign-key columns of the row; the projection happens
//! at the trigger.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TgOp {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl fmt::Display for TgOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TgOp::Insert => "INSERT",
            TgOp::Update => "UPDATE",
            TgOp::Delete => "DELETE",
            TgOp::Truncate => "TRUNCATE",
        };
        f.write_str(name)
    }
}

impl FromStr for TgOp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(TgOp::Insert),
            "UPDATE" => Ok(TgOp::Update),
            "DELETE" => Ok(TgOp::Delete),
            "TRUNCATE" => Ok(TgOp::Truncate),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub tg_op: TgOp,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub old: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub new: Map<String, Value>,
    #[serde(default)]
    pub xmin: Option<i64>,
    #[serde(default, deserialize_with = "null_as_empty_vec")]
    pub indices: Vec<String>,
}

impl ChangeEvent {
    /// The row image the translation rules should read: the old row for a
    /// DELETE when present, the new row otherwise.
    pub fn data(&self) -> &Map<String, Value> {
        if self.tg_op == TgOp::Delete && !self.old.is_empty() {
            &self.old
        } else {
            &self.new
        }
    }
}

// the trigger emits JSON nulls for absent row images
fn null_as_empty_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Map<String, Value>>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

fn null_as_empty_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Vec<String>>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}
