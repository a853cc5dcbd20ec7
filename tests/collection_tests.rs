//! Watermarked collection polling tests

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::VecDeque;
    use worldsync::collection::{
        CollectionRecord, CollectionSource, DeletePolicy, PollOutcome, RawBatch,
        WatermarkedCollection,
    };
    use worldsync::CollectionError;

    #[derive(Debug, Clone, Deserialize)]
    struct Friend {
        id: String,
        name: String,
        updated: u64,
    }

    impl CollectionRecord for Friend {
        fn key(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> u64 {
            self.updated
        }
    }

    /// Replays canned batches and records the watermark of every request.
    #[derive(Default)]
    struct Replay {
        batches: VecDeque<Result<RawBatch, CollectionError>>,
        requested_since: Vec<u64>,
    }

    impl CollectionSource for Replay {
        async fn fetch(&mut self, _collection: &str, since: u64) -> Result<RawBatch, CollectionError> {
            self.requested_since.push(since);
            self.batches.pop_front().unwrap_or_else(|| Ok(RawBatch::default()))
        }
    }

    fn friend(id: &str, updated: u64) -> serde_json::Value {
        json!({ "id": id, "name": format!("pony {id}"), "updated": updated })
    }

    fn batch(upserts: Vec<serde_json::Value>, more: bool) -> Result<RawBatch, CollectionError> {
        Ok(RawBatch {
            upserts,
            deletes: vec![],
            more,
        })
    }

    // -----------------------------------------------------------------------
    // Watermark
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn watermark_never_regresses_across_batches() {
        let mut c = WatermarkedCollection::<Friend>::new("friends", DeletePolicy::Remove);
        let mut src = Replay::default();
        src.batches.push_back(batch(vec![friend("a", 50), friend("b", 20)], false));
        src.batches.push_back(batch(vec![friend("c", 10)], false));

        assert_eq!(c.poll(&mut src, true, &mut ()).await, PollOutcome::Done);
        assert_eq!(c.watermark(), 50);
        assert_eq!(c.poll(&mut src, true, &mut ()).await, PollOutcome::Done);
        assert_eq!(c.watermark(), 50);
        assert_eq!(src.requested_since, vec![0, 50]);
        assert_eq!(c.len(), 3);
        assert_eq!(c.get("c").map(|f| f.name.as_str()), Some("pony c"));
    }

    #[tokio::test]
    async fn disconnected_poll_requests_nothing() {
        let mut c = WatermarkedCollection::<Friend>::new("friends", DeletePolicy::Remove);
        let mut src = Replay::default();
        assert_eq!(c.poll(&mut src, false, &mut ()).await, PollOutcome::Idle);
        assert!(src.requested_since.is_empty());
        assert_eq!(c.watermark(), 0);
    }

    // -----------------------------------------------------------------------
    // Truncation and failure
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn truncated_batches_are_drained_in_one_call() {
        let mut c = WatermarkedCollection::<Friend>::new("friends", DeletePolicy::Remove);
        let mut src = Replay::default();
        src.batches.push_back(batch(vec![friend("a", 1)], true));
        src.batches.push_back(batch(vec![friend("b", 2)], true));
        src.batches.push_back(batch(vec![friend("c", 3)], false));

        let outcome = c.poll_all(&mut src, true, &mut (), 10).await;
        assert_eq!(outcome, PollOutcome::Done);
        assert_eq!(src.requested_since, vec![0, 1, 2]);
        assert_eq!(c.len(), 3);
    }

    #[tokio::test]
    async fn fetch_failure_is_retried_later() {
        let mut c = WatermarkedCollection::<Friend>::new("friends", DeletePolicy::Remove);
        let mut src = Replay::default();
        src.batches
            .push_back(Err(CollectionError::Source("503".into())));
        src.batches.push_back(batch(vec![friend("a", 4)], false));

        assert_eq!(c.poll(&mut src, true, &mut ()).await, PollOutcome::Retry);
        assert_eq!(c.watermark(), 0);
        assert_eq!(c.poll(&mut src, true, &mut ()).await, PollOutcome::Done);
        assert_eq!(c.watermark(), 4);
    }

    #[tokio::test]
    async fn undecodable_record_is_retried_later() {
        let mut c = WatermarkedCollection::<Friend>::new("friends", DeletePolicy::Remove);
        let mut src = Replay::default();
        src.batches
            .push_back(batch(vec![friend("a", 9), json!({ "id": 3 })], false));

        assert_eq!(c.poll(&mut src, true, &mut ()).await, PollOutcome::Retry);
        assert!(c.is_empty());
        assert_eq!(c.watermark(), 0);
    }
}
