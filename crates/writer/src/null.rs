use async_trait::async_trait;
use stream::Reading;

use crate::{WriteError, WriteTarget};

/// Discards every batch. Selected by `WriterKind::Null` for `--dry-run` and
/// for tests that only care about buffering/retry behaviour, not wire
/// format.
#[derive(Debug, Default)]
pub struct NullTarget;

#[async_trait]
impl WriteTarget for NullTarget {
    async fn write_batch(&self, _readings: &[Reading]) -> Result<(), WriteError> {
        Ok(())
    }

    async fn probe_health(&self) -> bool {
        true
    }

    fn encode_for_dlq(&self, _readings: &[Reading]) -> Vec<u8> {
        Vec::new()
    }

    async fn replay_raw(&self, _payload: &[u8]) -> Result<(), WriteError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn always_accepts_and_reports_healthy() {
        let target = NullTarget;
        assert!(target.write_batch(&[]).await.is_ok());
        assert!(target.probe_health().await);
        assert_eq!(target.name(), "null");
    }
}
