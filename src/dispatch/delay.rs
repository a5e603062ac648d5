//! Deferred dispatch with a cancellation flag

use std::time::Duration;

use super::Action;
use crate::error::Result;
use crate::intent::LogicResult;
use crate::storage::document::Value;
use crate::Engine;

/// `status` value on the status document that cancels a deferred dispatch
pub const CANCELLED: &str = "cancelled";

impl Engine {
    /// Wait `delay`, then dispatch `action` unless the document at
    /// `status_path` has been marked cancelled in the meantime.
    ///
    /// Returns `None` when cancelled. The flag is only read once, after the
    /// wait; a cancellation arriving later does not stop the dispatch.
    pub async fn dispatch_delayed(
        &self,
        action: &Action,
        delay: Duration,
        status_path: &str,
    ) -> Result<Option<Vec<LogicResult>>> {
        tokio::time::sleep(delay).await;

        let status = self.store.get(status_path).await?;
        let cancelled = status
            .as_ref()
            .and_then(|doc| doc.get("status"))
            .and_then(Value::as_str)
            == Some(CANCELLED);
        if cancelled {
            tracing::info!("{} cancelled via '{}'", action.event_id, status_path);
            return Ok(None);
        }

        self.dispatch_business_logic(action).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::engine;
    use super::super::{logic_fn, ActionType, LogicConfig};
    use super::*;
    use crate::intent::WriteIntent;
    use crate::storage::document::Fields;
    use crate::storage::memory::MemoryStore;
    use crate::storage::DocumentStore;

    fn writer() -> LogicConfig {
        LogicConfig::new(
            "writer",
            logic_fn(|action, _, _| {
                let write = WriteIntent::create(action.path.clone(), Fields::new());
                Ok(LogicResult::finished("writer", vec![write]))
            }),
        )
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_is_skipped() {
        let store = MemoryStore::new();
        let engine = engine(&store, vec![writer()]);
        let action = Action::new("evt", ActionType::Create, "audit", "audits/a1");

        let mut status = Fields::new();
        status.insert("status".into(), CANCELLED.into());
        store.put("audits/status", status).await.unwrap();

        let outcome = engine
            .dispatch_delayed(&action, Duration::from_millis(5), "audits/status")
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(!store.exists("audits/a1").await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_after_delay() {
        let store = MemoryStore::new();
        let engine = engine(&store, vec![writer()]);
        let action = Action::new("evt", ActionType::Create, "audit", "audits/a1");

        let outcome = engine
            .dispatch_delayed(&action, Duration::from_millis(5), "audits/status")
            .await
            .unwrap();
        assert_eq!(outcome.map(|r| r.len()), Some(1));
        assert!(store.exists("audits/a1").await.unwrap());
    }
}
