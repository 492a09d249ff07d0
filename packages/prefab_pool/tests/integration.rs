//! Integration tests for prefab pools, exercised only through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use futures::executor::block_on;
use prefab_pool::{
    Backend, Error, GlobalPool, InstanceId, Kind, KindPool, Poolable, Result, SharedPools,
    Tracker, prepool,
};
use tokio_util::sync::CancellationToken;

/// A spawned mob. The backend hands them out as `Arc<Mob>`, so identity and liveness come
/// from the blanket `Poolable` implementation.
#[derive(Debug)]
struct Mob {
    template: &'static str,
}

#[derive(Debug, Default)]
struct MobSpawner {
    spawned: AtomicUsize,
    despawned: AtomicUsize,
}

impl Backend for MobSpawner {
    type Source = &'static str;
    type Placement = &'static str;
    type Instance = Arc<Mob>;

    async fn instantiate(
        &self,
        source: &&'static str,
        _placement: Option<&&'static str>,
        _cancel: &CancellationToken,
    ) -> Result<Arc<Mob>> {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Mob { template: *source }))
    }

    fn release(&self, _instance: Arc<Mob>) {
        self.despawned.fetch_add(1, Ordering::Relaxed);
    }
}

fn spawner() -> Arc<MobSpawner> {
    Arc::new(MobSpawner::default())
}

fn kind(spawner: &Arc<MobSpawner>, template: &'static str) -> Kind<MobSpawner> {
    Kind::builder(Arc::clone(spawner)).source(template).build()
}

fn kind_pool(spawner: &Arc<MobSpawner>, template: &'static str) -> KindPool<Kind<MobSpawner>> {
    KindPool::builder()
        .provider(kind(spawner, template))
        .untracked()
        .build()
        .unwrap()
}

#[test]
fn len_counts_distinct_idle_instances() {
    let spawner = spawner();
    let pool = kind_pool(&spawner, "wolf");

    let mobs: Vec<_> = (0..4).map(|_| block_on(pool.rent()).unwrap()).collect();
    assert!(pool.is_empty());

    pool.return_many(mobs.iter().take(3).cloned());
    assert_eq!(pool.len(), 3);

    // Returning the same mobs again changes nothing.
    pool.return_many(mobs.iter().take(3).cloned());
    assert_eq!(pool.len(), 3);

    let _wolf = block_on(pool.rent()).unwrap();
    assert_eq!(pool.len(), 2);
    assert_eq!(spawner.spawned.load(Ordering::Relaxed), 4);
}

#[test]
fn reuse_before_create_is_oldest_first() {
    let spawner = spawner();
    let pool = kind_pool(&spawner, "wolf");

    let first = block_on(pool.rent()).unwrap();
    let second = block_on(pool.rent()).unwrap();
    let first_id = first.instance_id();
    let second_id = second.instance_id();

    pool.return_instance(first);
    pool.return_instance(second);

    assert_eq!(block_on(pool.rent()).unwrap().instance_id(), first_id);
    assert_eq!(block_on(pool.rent()).unwrap().instance_id(), second_id);
    assert_eq!(spawner.spawned.load(Ordering::Relaxed), 2);
}

#[test]
fn release_excess_keeps_newest() {
    let spawner = spawner();
    let pool = kind_pool(&spawner, "wolf");

    let mobs: Vec<_> = (0..5).map(|_| block_on(pool.rent()).unwrap()).collect();
    let newest: Vec<InstanceId> = mobs.iter().skip(3).map(Poolable::instance_id).collect();
    pool.return_many(mobs);

    assert_eq!(pool.release_excess(2), 3);
    assert_eq!(spawner.despawned.load(Ordering::Relaxed), 3);

    let remaining: Vec<InstanceId> = (0..2)
        .map(|_| block_on(pool.rent()).unwrap().instance_id())
        .collect();
    assert_eq!(remaining, newest);
}

#[test]
fn prepooled_rents_create_nothing() {
    let spawner = spawner();
    let wolf = Kind::builder(Arc::clone(&spawner))
        .source("wolf")
        .prepool_count(3)
        .build();
    let pool = KindPool::builder().provider(wolf).untracked().build().unwrap();

    block_on(pool.prepool(Some("den"), &CancellationToken::new())).unwrap();
    assert_eq!(pool.len(), 3);
    assert_eq!(pool.placement(), Some("den"));

    for _ in 0..3 {
        block_on(pool.rent()).unwrap();
    }

    assert_eq!(spawner.spawned.load(Ordering::Relaxed), 3);
}

#[test]
fn prepool_function_fills_any_returnable_pool() {
    let spawner = spawner();
    let pool = kind_pool(&spawner, "wolf");
    let wolf_pack = Kind::builder(Arc::clone(&spawner))
        .source("wolf")
        .prepool_count(2)
        .build();

    block_on(prepool(&wolf_pack, &pool, Some("den"), &CancellationToken::new())).unwrap();

    assert_eq!(pool.len(), 2);
    assert_eq!(spawner.spawned.load(Ordering::Relaxed), 2);
}

#[test]
fn global_pool_prepools_sub_pool() {
    let spawner = spawner();
    let pool = GlobalPool::builder(Arc::clone(&spawner)).untracked().build();
    let wolf = Kind::builder(Arc::clone(&spawner))
        .source("wolf")
        .prepool_count(2)
        .build();

    block_on(pool.prepool(&wolf, None, &CancellationToken::new())).unwrap();
    assert_eq!(pool.len_of(&wolf), 2);

    let _mob = block_on(pool.rent(&wolf)).unwrap();
    assert_eq!(spawner.spawned.load(Ordering::Relaxed), 2);
}

#[test]
fn global_pool_routes_kindless_returns() {
    let spawner = spawner();
    let pool = GlobalPool::builder(Arc::clone(&spawner)).untracked().build();
    let wolf = kind(&spawner, "wolf");
    let bear = kind(&spawner, "bear");

    let a = block_on(pool.rent(&wolf)).unwrap();
    let b = block_on(pool.rent(&bear)).unwrap();
    let a_id = a.instance_id();

    pool.return_instance(a).unwrap();
    pool.return_instance(b).unwrap();

    assert!(!pool.is_registered(a_id));
    assert_eq!(pool.len_of(&wolf), 1);
    assert_eq!(pool.len_of(&bear), 1);

    let again = block_on(pool.rent(&wolf)).unwrap();
    assert_eq!(again.instance_id(), a_id);
    assert_eq!(again.template, "wolf");
}

#[test]
fn global_pool_rejects_foreign_instances() {
    let spawner = spawner();
    let pool = GlobalPool::builder(Arc::clone(&spawner)).untracked().build();

    let stranger = Arc::new(Mob { template: "ghost" });
    let id = stranger.instance_id();

    let result = pool.return_instance(stranger);

    assert!(matches!(result, Err(Error::UnregisteredInstance { id: rejected }) if rejected == id));
}

#[test]
fn aliases_share_one_sub_pool() {
    let spawner = spawner();
    let pool = GlobalPool::builder(Arc::clone(&spawner)).untracked().build();

    let a = block_on(pool.rent_source("wolf")).unwrap();
    let b = block_on(pool.rent_source("wolf")).unwrap();
    pool.return_instance(a).unwrap();
    pool.return_instance(b).unwrap();

    assert_eq!(pool.sub_pool_count(), 1);
    assert_eq!(pool.len_of(&kind(&spawner, "wolf")), 2);
}

#[test]
fn cancelled_rent_changes_nothing() {
    let spawner = spawner();
    let pool = GlobalPool::builder(Arc::clone(&spawner)).untracked().build();
    let wolf = kind(&spawner, "wolf");

    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = block_on(pool.rent_with(&wolf, &cancel));

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(pool.sub_pool_count(), 0);
    assert_eq!(spawner.spawned.load(Ordering::Relaxed), 0);
}

#[test]
fn tracker_sees_rented_and_idle_instances() {
    let tracker = Tracker::builder().enabled(true).build();
    let spawner = spawner();
    let pool = GlobalPool::builder(Arc::clone(&spawner))
        .tracker(Arc::clone(&tracker))
        .build();
    let wolf = kind(&spawner, "wolf");

    let a = block_on(pool.rent(&wolf)).unwrap();
    let b = block_on(pool.rent(&wolf)).unwrap();
    pool.return_instance(a).unwrap();

    let entries = tracker.snapshot();
    assert_eq!(entries.len(), 1);

    let entry = entries.first().unwrap();
    assert_eq!(entry.label(), "KindPool<Kind<MobSpawner>>");
    assert_eq!(entry.count_inactive(), 1);
    assert_eq!(entry.count_active(), 1);
    assert_eq!(entry.max_recorded(), 2);

    // A mob destroyed by the game is no longer counted once swept.
    drop(b);
    let entry = tracker.snapshot().into_iter().next().unwrap();
    assert_eq!(entry.count_active(), 0);
    assert!(tracker.take_dirty());
}

#[test]
fn concurrent_rent_and_return_keep_pool_consistent() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 100;

    let spawner = spawner();
    let pool = Arc::new(kind_pool(&spawner, "wolf"));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let mob = block_on(pool.rent()).unwrap();
                    pool.return_instance(mob);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let spawned = spawner.spawned.load(Ordering::Relaxed);
    assert!(spawned <= THREADS);
    assert_eq!(pool.len(), spawned);
}

#[test]
fn shared_registry_hands_out_the_same_pool() {
    let spawner = spawner();
    let registry = SharedPools::new();

    let registered = registry
        .register("wolves", kind_pool(&spawner, "wolf"))
        .unwrap();
    let shared = registry
        .get::<KindPool<Kind<MobSpawner>>>("wolves")
        .unwrap();

    let mob = block_on(shared.rent()).unwrap();
    registered.return_instance(mob);

    assert_eq!(shared.len(), 1);
}
