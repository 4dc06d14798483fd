use std::sync::Arc;
use std::thread;

use vectormap_rs::{Config, VectorMap};

fn map() -> VectorMap {
    VectorMap::new(Config {
        mem_cap: 8 << 20,
        num_shards: 2,
        capacity_hint: 128,
        ..Config::default()
    })
}

#[test]
fn test_clear_basic() {
    let m = map();

    for i in 0..100u32 {
        assert!(m.reput(format!("c-{i}").as_bytes(), format!("v-{i}").as_bytes()));
    }
    assert_eq!(m.items(), 100);
    let used = m.used_mem();
    assert!(used > 0);

    m.clear();

    assert_eq!(m.items(), 0);
    assert_eq!(m.count(), 0);
    assert!(m.used_mem() < used);
    for i in 0..100u32 {
        assert!(m.get(format!("c-{i}").as_bytes()).is_none());
    }
}

#[test]
fn test_clear_empty_map() {
    let m = map();
    m.clear();
    assert_eq!(m.items(), 0);
    assert_eq!(m.count(), 0);
}

#[test]
fn test_clear_and_reinsert() {
    let m = map();

    for i in 0..50u32 {
        assert!(m.reput(format!("old-{i}").as_bytes(), b"old"));
    }
    m.clear();

    for i in 0..50u32 {
        assert!(m.reput(format!("new-{i}").as_bytes(), format!("nv-{i}").as_bytes()));
    }
    assert_eq!(m.items(), 50);
    for i in 0..50u32 {
        assert_eq!(&*m.get(format!("new-{i}").as_bytes()).unwrap(), format!("nv-{i}").as_bytes());
        assert!(m.get(format!("old-{i}").as_bytes()).is_none());
    }
}

#[test]
fn test_clear_multiple_times() {
    let m = map();

    for round in 0..5u32 {
        for i in 0..20u32 {
            assert!(m.reput(format!("r{round}-{i}").as_bytes(), &round.to_le_bytes()));
        }
        assert_eq!(m.items(), 20);
        m.clear();
        assert_eq!(m.items(), 0);
    }
}

#[test]
fn test_clear_concurrent_with_ops() {
    let m = Arc::new(map());

    for i in 0..200u32 {
        assert!(m.reput(format!("cc-{i}").as_bytes(), b"x"));
    }

    let m1 = Arc::clone(&m);
    let m2 = Arc::clone(&m);
    let m3 = Arc::clone(&m);

    let handles = vec![
        thread::spawn(move || {
            m1.clear();
        }),
        thread::spawn(move || {
            for i in 200..300u32 {
                let _ = m2.reput(format!("cc-{i}").as_bytes(), b"y");
            }
        }),
        thread::spawn(move || {
            for i in 0..200u32 {
                let _ = m3.get(format!("cc-{i}").as_bytes());
            }
        }),
    ];
    for h in handles {
        h.join().unwrap();
    }

    // consistent accounting whatever the interleaving
    assert_eq!(m.count(), m.items());
}

#[test]
fn test_close_shuts_the_map_down() {
    let m = map();

    for i in 0..30u32 {
        assert!(m.reput(format!("x-{i}").as_bytes(), b"v"));
    }
    m.close();

    assert_eq!(m.items(), 0);
    assert!(m.get(b"x-0").is_none());
    assert!(!m.has(b"x-1"));
    assert!(!m.reput(b"x-2", b"v"));
    assert!(!m.put(b"x-3", b"v"));
    assert!(!m.delete(b"x-4"));
}
