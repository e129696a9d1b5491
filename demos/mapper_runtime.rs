//! Minimal mapper-runtime wiring: one cache per runtime instance, with shared
//! mapping plans as the cached payload.

use std::sync::Arc;
use tricache_rs::TypeTripleCache;

struct Order;
struct OrderDto;
struct AuditContext;

struct MapperInfo {
    name: &'static str,
}

fn main() {
    let cache: TypeTripleCache<Arc<MapperInfo>> = TypeTripleCache::with_capacity(16);

    let plan = cache.get_or_insert_for::<Order, OrderDto, AuditContext>(|| {
        println!("building mapping plan (expensive, happens once)");
        Arc::new(MapperInfo {
            name: "Order -> OrderDto",
        })
    });

    let cached = cache.get_or_insert_for::<Order, OrderDto, AuditContext>(|| {
        unreachable!("already cached")
    });
    assert!(Arc::ptr_eq(&plan, &cached));

    // The reverse direction is a different triple and gets its own plan.
    cache.get_or_insert_for::<OrderDto, Order, AuditContext>(|| {
        Arc::new(MapperInfo {
            name: "OrderDto -> Order",
        })
    });

    println!(
        "cached plan: {} (entries: {}, table: {}, longest chain: {})",
        plan.name,
        cache.len(),
        cache.capacity(),
        cache.depth()
    );
}
