use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use vectormap_rs::{Config, Tunables, VectorMap};

fn shared_map() -> Arc<VectorMap> {
    Arc::new(VectorMap::new(Config {
        mem_cap: 64 << 20,
        num_shards: 8,
        capacity_hint: 1024,
        ..Config::default()
    }))
}

#[test]
fn concurrent_mixed_ops() {
    let m = shared_map();
    let n_threads = 6;
    let iters = 3_000;
    let barrier = Arc::new(Barrier::new(n_threads));

    let mut handles = Vec::new();
    for t in 0..n_threads {
        let b = barrier.clone();
        let map = m.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            for i in 0..iters {
                let k = format!("k:{}:{}", t, i % 512);
                match i % 4 {
                    0 => {
                        let _ = map.reput(k.as_bytes(), format!("v:{i}").as_bytes());
                    }
                    1 => {
                        let _ = map.get(k.as_bytes());
                    }
                    2 => {
                        let _ = map.has(k.as_bytes());
                    }
                    _ => {
                        let _ = map.delete(k.as_bytes());
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(m.items() <= (n_threads * 512) as u64);
    assert_eq!(m.count(), m.items());
}

#[test]
fn concurrent_readers_see_complete_values() {
    let m = shared_map();
    let n_keys = 256u32;

    // each key's value is a run of one repeated byte; a torn read
    // would mix runs
    for i in 0..n_keys {
        let val = vec![i as u8; 512];
        assert!(m.reput(format!("stable:{i}").as_bytes(), &val));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for _ in 0..4 {
        let map = m.clone();
        let s = stop.clone();
        handles.push(thread::spawn(move || {
            while !s.load(Ordering::Relaxed) {
                for i in 0..n_keys {
                    if let Some(v) = map.get(format!("stable:{i}").as_bytes()) {
                        let b = v[0];
                        assert!(v.iter().all(|&x| x == b), "torn value for key {i}");
                        assert!(v.len() == 512 || v.len() == 513);
                    }
                }
            }
        }));
    }

    // writers rewrite the same keys with runs of a different length
    for w in 0..2 {
        let map = m.clone();
        let s = stop.clone();
        handles.push(thread::spawn(move || {
            let mut round = 0u32;
            while !s.load(Ordering::Relaxed) {
                for i in (w..n_keys).step_by(2) {
                    let val = vec![(i + round) as u8; 513];
                    let _ = map.put(format!("stable:{i}").as_bytes(), &val);
                }
                round = round.wrapping_add(1);
                thread::yield_now();
            }
        }));
    }

    thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn concurrent_maintenance_with_readers() {
    let m = Arc::new(VectorMap::new(Config {
        mem_cap: 2 << 20,
        num_shards: 2,
        capacity_hint: 1024,
        tunables: Tunables {
            eliminate_miss_rate: 0.0,
            eliminate_start: 0.3,
            eliminate_end: 0.2,
            garbage_rate: 0.2,
        },
    }));

    for i in 0..2_000u32 {
        assert!(m.reput(format!("maint:{i}").as_bytes(), &vec![i as u8; 320]));
    }
    // churn to build garbage
    for i in 0..2_000u32 {
        let _ = m.put(format!("maint:{i}").as_bytes(), &vec![!i as u8; 320]);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for r in 0..4 {
        let map = m.clone();
        let s = stop.clone();
        handles.push(thread::spawn(move || {
            while !s.load(Ordering::Relaxed) {
                for i in (r..2_000u32).step_by(4) {
                    if let Some(v) = map.get(format!("maint:{i}").as_bytes()) {
                        assert_eq!(v.len(), 320, "wrong length for key {i}");
                        let b = v[0];
                        assert!(v.iter().all(|&x| x == b), "torn value for key {i}");
                    }
                }
            }
        }));
    }

    let maintainer = {
        let map = m.clone();
        let s = stop.clone();
        thread::spawn(move || {
            while !s.load(Ordering::Relaxed) {
                let _ = map.maintain();
                thread::sleep(Duration::from_millis(10));
            }
        })
    };

    thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.join().unwrap();
    }
    maintainer.join().unwrap();

    assert_eq!(m.count(), m.items());
}

#[test]
fn concurrent_writers_single_key() {
    let m = shared_map();
    assert!(m.reput(b"contended", b"0"));

    let n_threads = 4;
    let barrier = Arc::new(Barrier::new(n_threads));
    let mut handles = Vec::new();
    for t in 0..n_threads {
        let b = barrier.clone();
        let map = m.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            for i in 0..2_000u32 {
                let val = format!("{}:{}", t, i);
                let _ = map.put(b"contended", val.as_bytes());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // last writer wins; the value is one of the written strings
    let v = m.get(b"contended").unwrap();
    let s = std::str::from_utf8(&v).unwrap();
    let (t, i) = s.split_once(':').unwrap();
    assert!(t.parse::<u32>().unwrap() < n_threads as u32);
    assert_eq!(i.parse::<u32>().unwrap(), 1_999);
    assert_eq!(m.items(), 1);
}
