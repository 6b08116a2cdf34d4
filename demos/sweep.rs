//! Fills a couple of pools, lets one of them go idle and watches the sweep
//! hand the memory back. Run with `RUST_LOG=mempools=debug` to see every
//! chunk come and go, and set `MEMPOOLS_IDLE_LIMIT` to change how eager the
//! sweep is.

use std::time::Duration;

use mempools::{PoolKind, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mempools=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut registry = Registry::from_env();
    println!("Idle limit: {}", registry.idle_limit());

    let sessions = registry.create("session", 200);
    let buffers = registry.create("buffer", 4096);
    let headers = registry.create_with_kind("header", 48, PoolKind::Flat);

    // Long lived objects.
    let live: Vec<_> = {
        let pool = registry.pool_mut(sessions).unwrap();
        (0..300).map(|_| pool.alloc()).collect()
    };

    // A burst that is over quickly.
    let pool = registry.pool_mut(buffers).unwrap();
    let burst: Vec<_> = (0..2000).map(|_| pool.alloc()).collect();
    for obj in burst {
        unsafe { pool.free(obj) };
    }

    let pool = registry.pool_mut(headers).unwrap();
    let small: Vec<_> = (0..500).map(|_| pool.alloc()).collect();
    for obj in small {
        unsafe { pool.free(obj) };
    }

    println!("\nBefore the sweep:");
    for pool in registry.iter_mut() {
        println!("  {}", pool.stats());
    }
    println!("Allocated: {} bytes", registry.total_allocated());

    registry.clean(Duration::from_secs(15));

    println!("\nAfter the sweep:");
    for pool in registry.iter_mut() {
        println!("  {}", pool.stats());
    }
    println!("\n{}", registry.global_stats());

    let pool = registry.pool_mut(sessions).unwrap();
    for obj in live {
        unsafe { pool.free(obj) };
    }

    for id in [sessions, buffers, headers] {
        registry.destroy(id);
    }
}
