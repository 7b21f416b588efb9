use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::archivist::Archivist;
use crate::archivist::error::ArchivistError;
use crate::archivist::ids::AccountId;
use crate::archivist::scheduled_tasks::Task;
use crate::archivist::trove::Trove;

/// What a harvest collects. Each kind is its own periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarvestKind {
    Timeline,
    Likes,
    DirectMessages,
}

impl HarvestKind {
    pub const ALL: [HarvestKind; 3] = [
        HarvestKind::Timeline,
        HarvestKind::Likes,
        HarvestKind::DirectMessages,
    ];

    pub fn task_name(self) -> &'static str {
        match self {
            HarvestKind::Timeline => "timeline_harvest",
            HarvestKind::Likes => "likes_harvest",
            HarvestKind::DirectMessages => "direct_messages_harvest",
        }
    }

    fn default_initial_delay(self) -> Duration {
        match self {
            HarvestKind::Timeline => Duration::from_secs(5),
            HarvestKind::Likes => Duration::from_secs(15),
            HarvestKind::DirectMessages => Duration::from_secs(10),
        }
    }

    fn default_interval(self) -> Duration {
        match self {
            HarvestKind::Timeline => Duration::from_secs(3 * 60),
            HarvestKind::Likes => Duration::from_secs(10 * 60),
            HarvestKind::DirectMessages => Duration::from_secs(30),
        }
    }
}

/// Talks to the remote source and turns what it finds into a [`Trove`]. Implementations
/// carry their own timeouts and report failures instead of hanging.
#[async_trait]
pub trait Harvester: Send + Sync {
    async fn harvest(&self, kind: HarvestKind) -> anyhow::Result<Trove>;

    /// Re-fetches accounts that lost their handle during a merge, so their new handles get
    /// recorded. Harvesters that cannot look accounts up by ID return an empty trove.
    async fn refresh_accounts(&self, _ids: &[AccountId]) -> anyhow::Result<Trove> {
        Ok(Trove::new())
    }
}

/// One harvest-and-merge cycle per run.
pub struct HarvestTask {
    kind: HarvestKind,
    harvester: Arc<dyn Harvester>,
    initial_delay: Duration,
    interval: Duration,
}

impl HarvestTask {
    pub fn new(kind: HarvestKind, harvester: Arc<dyn Harvester>) -> Self {
        Self {
            kind,
            harvester,
            initial_delay: kind.default_initial_delay(),
            interval: kind.default_interval(),
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// A task for every [`HarvestKind`], ready for [`Archivist::start_scheduler`].
    pub fn standard_tasks(harvester: Arc<dyn Harvester>) -> Vec<Arc<dyn Task>> {
        HarvestKind::ALL
            .into_iter()
            .map(|kind| Arc::new(HarvestTask::new(kind, harvester.clone())) as Arc<dyn Task>)
            .collect()
    }

    pub fn kind(&self) -> HarvestKind {
        self.kind
    }
}

#[async_trait]
impl Task for HarvestTask {
    fn name(&self) -> &'static str {
        self.kind.task_name()
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, archivist: &Archivist) -> Result<(), ArchivistError> {
        let target_name = self.kind.task_name();
        let trove = self.harvester.harvest(self.kind).await?;
        if trove.is_empty() {
            tracing::debug!(
                target: "archivist::scheduler::harvest",
                "{}: nothing new",
                target_name
            );
            return Ok(());
        }

        let superseded = archivist.merge(trove).await?;

        if !superseded.is_empty() {
            tracing::info!(
                target: "archivist::scheduler::harvest",
                "{}: {} account(s) lost their handle, refreshing",
                target_name,
                superseded.len()
            );
            let refreshed = self.harvester.refresh_accounts(&superseded).await?;
            if !refreshed.is_empty() {
                archivist.merge(refreshed).await?;
            }
        }

        tracing::info!(
            target: "archivist::scheduler::harvest",
            "{} completed",
            target_name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::archivist::accounts::Account;
    use crate::archivist::ids::PostId;
    use crate::archivist::posts::Post;
    use crate::archivist::test_utils::{create_test_archivist, test_post};

    #[derive(Default)]
    struct FakeHarvester {
        troves: Mutex<Vec<Trove>>,
        refreshed: Mutex<Vec<Vec<AccountId>>>,
        fail: bool,
    }

    #[async_trait]
    impl Harvester for FakeHarvester {
        async fn harvest(&self, _kind: HarvestKind) -> anyhow::Result<Trove> {
            if self.fail {
                anyhow::bail!("remote source unreachable");
            }
            Ok(self.troves.lock().unwrap().pop().unwrap_or_default())
        }

        async fn refresh_accounts(&self, ids: &[AccountId]) -> anyhow::Result<Trove> {
            self.refreshed.lock().unwrap().push(ids.to_vec());
            let mut trove = Trove::new();
            for id in ids {
                trove.add_account(Account::new(*id, format!("renamed_{id}")));
            }
            Ok(trove)
        }
    }

    #[tokio::test]
    async fn test_harvest_merges_trove() {
        let (archivist, _downloader, _dir) = create_test_archivist().await;
        let mut trove = Trove::new();
        trove.add_account(Account::new(AccountId(1), "kashi"));
        trove.add_post(test_post(PostId(3), AccountId(1), "harvested"));
        let harvester = Arc::new(FakeHarvester {
            troves: Mutex::new(vec![trove]),
            ..Default::default()
        });

        let task = HarvestTask::new(HarvestKind::Timeline, harvester.clone());
        task.execute(&archivist).await.unwrap();

        let post = Post::find_by_id(PostId(3), archivist.database())
            .await
            .unwrap();
        assert_eq!(post.text, "harvested");
        assert!(harvester.refreshed.lock().unwrap().is_empty());

        // Nothing left to harvest
        task.execute(&archivist).await.unwrap();
    }

    #[tokio::test]
    async fn test_superseded_accounts_are_refreshed() {
        let (archivist, _downloader, _dir) = create_test_archivist().await;
        archivist
            .save_account(&mut Account::new(AccountId(1), "kashi"))
            .await
            .unwrap();
        let mut trove = Trove::new();
        trove.add_account(Account::new(AccountId(2), "kashi"));
        let harvester = Arc::new(FakeHarvester {
            troves: Mutex::new(vec![trove]),
            ..Default::default()
        });

        HarvestTask::new(HarvestKind::Likes, harvester.clone())
            .execute(&archivist)
            .await
            .unwrap();

        assert_eq!(
            *harvester.refreshed.lock().unwrap(),
            vec![vec![AccountId(1)]]
        );
        let renamed = Account::find_by_id(AccountId(1), archivist.database())
            .await
            .unwrap();
        assert_eq!(renamed.handle, "renamed_1");
    }

    #[tokio::test]
    async fn test_harvest_failure_is_reported() {
        let (archivist, _downloader, _dir) = create_test_archivist().await;
        let harvester = Arc::new(FakeHarvester {
            fail: true,
            ..Default::default()
        });

        let err = HarvestTask::new(HarvestKind::DirectMessages, harvester)
            .execute(&archivist)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchivistError::Other(_)));
    }

    #[test]
    fn test_standard_tasks() {
        let tasks = HarvestTask::standard_tasks(Arc::new(FakeHarvester::default()));
        let names: Vec<&str> = tasks.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec!["timeline_harvest", "likes_harvest", "direct_messages_harvest"]
        );
        let dm = HarvestTask::new(
            HarvestKind::DirectMessages,
            Arc::new(FakeHarvester::default()),
        )
        .with_interval(Duration::from_secs(5));
        assert_eq!(dm.interval(), Duration::from_secs(5));
        assert_eq!(dm.kind(), HarvestKind::DirectMessages);
    }
}
