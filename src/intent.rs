//! Write-intents and logic results
//!
//! A [`WriteIntent`] is a pending mutation produced by a logic function. It
//! is never stored; the consolidator reduces a batch of them to at most one
//! per destination path and the writer turns the survivors into physical
//! writes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::storage::document::{Fields, Value};
use crate::storage::FieldTransform;

/// What a write-intent does to its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntentAction {
    Create,
    Merge,
    Delete,
    Copy,
    RecursiveCopy,
    RecursiveDelete,
    SubmitForm,
    SimulateSubmitForm,
}

impl IntentAction {
    pub fn is_form(&self) -> bool {
        matches!(self, IntentAction::SubmitForm | IntentAction::SimulateSubmitForm)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentAction::Create => "create",
            IntentAction::Merge => "merge",
            IntentAction::Delete => "delete",
            IntentAction::Copy => "copy",
            IntentAction::RecursiveCopy => "recursive-copy",
            IntentAction::RecursiveDelete => "recursive-delete",
            IntentAction::SubmitForm => "submit-form",
            IntentAction::SimulateSubmitForm => "simulate-submit-form",
        }
    }
}

impl fmt::Display for IntentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field-level operation carried alongside a merge
///
/// | Text        | Meaning                         |
/// |-------------|---------------------------------|
/// | `++` / `--` | increment / decrement by one    |
/// | `+N` / `-N` | add / subtract `N`              |
/// | `arr+(id)`  | add `id` to an array if absent  |
/// | `arr-(id)`  | remove `id` from an array       |
/// | `del`       | remove the field                |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Instruction {
    Increment(i64),
    ArrayUnion(String),
    ArrayRemove(String),
    Delete,
}

impl Instruction {
    pub fn to_transform(&self) -> FieldTransform {
        match self {
            Instruction::Increment(n) => FieldTransform::Increment(*n),
            Instruction::ArrayUnion(id) => FieldTransform::ArrayUnion(Value::String(id.clone())),
            Instruction::ArrayRemove(id) => FieldTransform::ArrayRemove(Value::String(id.clone())),
            Instruction::Delete => FieldTransform::Delete,
        }
    }
}

impl FromStr for Instruction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInstruction { opcode: s.to_string() };
        match s {
            "++" => return Ok(Instruction::Increment(1)),
            "--" => return Ok(Instruction::Increment(-1)),
            "del" => return Ok(Instruction::Delete),
            _ => {}
        }

        let array_arg = |prefix: &str| {
            s.strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(')'))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        };
        if let Some(id) = array_arg("arr+(") {
            return Ok(Instruction::ArrayUnion(id));
        }
        if let Some(id) = array_arg("arr-(") {
            return Ok(Instruction::ArrayRemove(id));
        }

        if let Some(n) = s.strip_prefix('+') {
            return n.parse::<i64>().map(Instruction::Increment).map_err(|_| invalid());
        }
        if s.starts_with('-') {
            return s.parse::<i64>().map(Instruction::Increment).map_err(|_| invalid());
        }
        Err(invalid())
    }
}

impl TryFrom<String> for Instruction {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Instruction> for String {
    fn from(instruction: Instruction) -> Self {
        instruction.to_string()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Increment(1) => f.write_str("++"),
            Instruction::Increment(-1) => f.write_str("--"),
            Instruction::Increment(n) if *n < 0 => write!(f, "{}", n),
            Instruction::Increment(n) => write!(f, "+{}", n),
            Instruction::ArrayUnion(id) => write!(f, "arr+({})", id),
            Instruction::ArrayRemove(id) => write!(f, "arr-({})", id),
            Instruction::Delete => f.write_str("del"),
        }
    }
}

/// Application priority of a consolidated write. Sorts high first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// A pending mutation (LogicResultDoc)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteIntent {
    pub action: IntentAction,
    pub dst_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Fields>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instructions: BTreeMap<String, Instruction>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_entity_during_recursion: Vec<String>,
    #[serde(default)]
    pub skip_run_view_logics: bool,
}

impl WriteIntent {
    pub fn new(action: IntentAction, dst_path: impl Into<String>) -> Self {
        Self {
            action,
            dst_path: dst_path.into(),
            src_path: None,
            doc: None,
            instructions: BTreeMap::new(),
            priority: Priority::Normal,
            skip_entity_during_recursion: Vec::new(),
            skip_run_view_logics: false,
        }
    }

    pub fn create(dst_path: impl Into<String>, doc: Fields) -> Self {
        Self::new(IntentAction::Create, dst_path).doc(doc)
    }

    pub fn merge(dst_path: impl Into<String>, doc: Fields) -> Self {
        Self::new(IntentAction::Merge, dst_path).doc(doc)
    }

    pub fn delete(dst_path: impl Into<String>) -> Self {
        Self::new(IntentAction::Delete, dst_path)
    }

    pub fn copy(src_path: impl Into<String>, dst_path: impl Into<String>) -> Self {
        Self::new(IntentAction::Copy, dst_path).src(src_path)
    }

    pub fn recursive_copy(src_path: impl Into<String>, dst_path: impl Into<String>) -> Self {
        Self::new(IntentAction::RecursiveCopy, dst_path).src(src_path)
    }

    pub fn recursive_delete(dst_path: impl Into<String>) -> Self {
        Self::new(IntentAction::RecursiveDelete, dst_path)
    }

    pub fn submit_form(dst_path: impl Into<String>, doc: Fields) -> Self {
        Self::new(IntentAction::SubmitForm, dst_path).doc(doc)
    }

    pub fn simulate_submit_form(dst_path: impl Into<String>, doc: Fields) -> Self {
        Self::new(IntentAction::SimulateSubmitForm, dst_path).doc(doc)
    }

    pub fn doc(mut self, doc: Fields) -> Self {
        self.doc = Some(doc);
        self
    }

    pub fn src(mut self, src_path: impl Into<String>) -> Self {
        self.src_path = Some(src_path.into());
        self
    }

    /// Set one field of the document
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.doc.get_or_insert_with(Fields::new).insert(key.into(), value.into());
        self
    }

    pub fn instruction(mut self, field: impl Into<String>, instruction: Instruction) -> Self {
        self.instructions.insert(field.into(), instruction);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn skip_entity(mut self, entity: impl Into<String>) -> Self {
        self.skip_entity_during_recursion.push(entity.into());
        self
    }

    pub fn skip_view_logics(mut self) -> Self {
        self.skip_run_view_logics = true;
        self
    }

    /// Top-level fields touched by the document or the instructions
    pub fn modified_fields(&self) -> BTreeSet<String> {
        let doc_keys = self.doc.iter().flat_map(|d| d.keys());
        doc_keys
            .chain(self.instructions.keys())
            .map(|key| key.split('.').next().unwrap_or(key).to_string())
            .collect()
    }

    pub fn source_path(&self) -> Result<&str> {
        self.src_path.as_deref().ok_or_else(|| Error::IncompleteIntent {
            path: self.dst_path.clone(),
            field: "srcPath",
        })
    }
}

/// Outcome of one logic invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicStatus {
    Finished,
    Error,
    PartialResult,
    CancelThenRetry,
}

/// What a logic function returns for one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicResult {
    pub name: String,
    pub status: LogicStatus,
    #[serde(default)]
    pub documents: Vec<WriteIntent>,
    #[serde(default)]
    pub exec_time: Duration,
    /// Continuation marker passed back on the next page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page: Option<Value>,
    #[serde(default)]
    pub transactional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LogicResult {
    fn with_status(name: impl Into<String>, status: LogicStatus, documents: Vec<WriteIntent>) -> Self {
        Self {
            name: name.into(),
            status,
            documents,
            exec_time: Duration::ZERO,
            next_page: None,
            transactional: false,
            message: None,
        }
    }

    pub fn finished(name: impl Into<String>, documents: Vec<WriteIntent>) -> Self {
        Self::with_status(name, LogicStatus::Finished, documents)
    }

    pub fn partial(name: impl Into<String>, documents: Vec<WriteIntent>, next_page: Value) -> Self {
        let mut result = Self::with_status(name, LogicStatus::PartialResult, documents);
        result.next_page = Some(next_page);
        result
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::with_status(name, LogicStatus::Error, Vec::new());
        result.message = Some(message.into());
        result
    }

    pub fn cancel_then_retry(name: impl Into<String>) -> Self {
        Self::with_status(name, LogicStatus::CancelThenRetry, Vec::new())
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }
}
