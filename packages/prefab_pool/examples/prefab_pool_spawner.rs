//! Spawns waves of enemies through a global pool, despawning each wave after a short delay.
//!
//! Only the first wave has to create enemies; later waves reuse the despawned ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use prefab_pool::{Backend, GlobalPool, Kind, Result, Tracker, despawn_after};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Enemy {
    template: &'static str,
}

#[derive(Default)]
struct Spawner {
    created: AtomicUsize,
}

impl Backend for Spawner {
    type Source = &'static str;
    type Placement = &'static str;
    type Instance = Arc<Enemy>;

    async fn instantiate(
        &self,
        source: &&'static str,
        _placement: Option<&&'static str>,
        _cancel: &CancellationToken,
    ) -> Result<Arc<Enemy>> {
        // Stands in for loading the template from storage.
        tokio::time::sleep(Duration::from_millis(20)).await;

        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Enemy { template: *source }))
    }

    fn release(&self, _instance: Arc<Enemy>) {}
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let tracker = Tracker::builder().enabled(true).build();
    let spawner = Arc::new(Spawner::default());

    let pool = GlobalPool::builder(Arc::clone(&spawner))
        .tracker(Arc::clone(&tracker))
        .build();

    let goblin = Kind::builder(Arc::clone(&spawner))
        .source("goblin")
        .placement("cave")
        .prepool_count(2)
        .build();

    pool.prepool(&goblin, None, &CancellationToken::new()).await?;

    let cancel = CancellationToken::new();

    for wave in 1..=3 {
        let mut enemies = Vec::new();

        for _ in 0..3 {
            enemies.push(pool.rent(&goblin).await?);
        }

        println!(
            "wave {wave}: {} x {}",
            enemies.len(),
            enemies.first().map_or("nothing", |enemy| enemy.template)
        );

        for entry in tracker.snapshot() {
            println!("  {entry}");
        }

        for enemy in enemies {
            despawn_after(&pool, enemy, Duration::from_millis(10), &cancel).await;
        }
    }

    println!(
        "created {} enemies for 9 spawns",
        spawner.created.load(Ordering::Relaxed)
    );

    pool.dispose();
    Ok(())
}
