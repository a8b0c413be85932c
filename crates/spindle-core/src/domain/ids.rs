//! Task identity.
//!
//! IDs are issued by the record store (monotonic, never reused), so unlike
//! the broker entry they are not generated on the client side.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Identifier of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(TaskId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_order_by_issue_sequence() {
        assert!(TaskId::new(1) < TaskId::new(2));
        assert_eq!(TaskId::from(7).get(), 7);
    }

    #[test]
    fn id_serializes_as_bare_number() {
        let s = serde_json::to_string(&TaskId::new(42)).unwrap();
        assert_eq!(s, "42");
        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, TaskId::new(42));
    }

    #[test]
    fn id_parses_from_cli_input() {
        assert_eq!(" 12 ".parse::<TaskId>().unwrap(), TaskId::new(12));
        assert!("abc".parse::<TaskId>().is_err());
    }
}
