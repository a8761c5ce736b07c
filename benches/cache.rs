use std::hint::black_box;

use procsym::GCacheOptions;
use procsym::GenerationalCache;

use criterion::measurement::Measurement;
use criterion::Bencher;
use criterion::BenchmarkGroup;


/// Benchmark lookups of present keys in a full cache.
fn gcache_get<M>(b: &mut Bencher<'_, M>)
where
    M: Measurement,
{
    let cache = GenerationalCache::new(GCacheOptions::new(1024, 3));
    for pid in 0..1024u32 {
        let () = cache.put(pid, u64::from(pid));
    }

    let mut pid = 0u32;
    let () = b.iter(|| {
        pid = (pid + 7) % 1024;
        let value = cache.get(black_box(&pid));
        let _value = black_box(value);
    });
}

/// Benchmark a complete collection cycle: a round of insertions
/// followed by expiration of the state of the previous one.
fn gcache_round_cycle<M>(b: &mut Bencher<'_, M>)
where
    M: Measurement,
{
    let cache = GenerationalCache::new(GCacheOptions::new(512, 1));
    let mut base = 0u32;

    let () = b.iter(|| {
        let () = cache.advance_round();
        for pid in base..base + 256 {
            let () = cache.put(pid, u64::from(pid));
        }
        base = base.wrapping_add(128);
        let evicted = cache.evict_expired();
        let _evicted = black_box(evicted);
    });
}


pub fn benchmark<M>(group: &mut BenchmarkGroup<'_, M>)
where
    M: Measurement,
{
    bench_sub_fn!(group, gcache_get);
    bench_sub_fn!(group, gcache_round_cycle);
}
