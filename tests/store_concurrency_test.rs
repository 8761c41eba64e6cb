use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use eni_cni::config::IpVersion;
use eni_cni::ipam::{ImdsAllocator, Store};
use eni_cni::metadata::{Metadata, StaticMetadata};

const WORKERS: usize = 8;

fn metadata() -> Metadata<StaticMetadata> {
    let ips: Vec<String> = (10..30).map(|i| format!("10.0.0.{}", i)).collect();
    let ips: Vec<&str> = ips.iter().map(String::as_str).collect();
    let mut md = StaticMetadata::new();
    md.add_interface("0a:00:00:00:00:01", 0, "10.0.0.0/24", &ips);
    Metadata::new(md)
}

/// One plugin invocation: open, allocate, close.
fn allocate(dir: &Path, id: &str) -> IpAddr {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let md = metadata();
    let mut store = Store::open(dir).unwrap();
    let ip = runtime
        .block_on(ImdsAllocator::new(&mut store, &md).get(id, "eth0", IpVersion::V4))
        .unwrap();
    store.close().unwrap();
    ip.address.ip()
}

#[test]
fn test_concurrent_allocations_never_collide() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = Arc::new(tmp.path().join("pods"));
    let barrier = Arc::new(Barrier::new(WORKERS));

    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let dir = Arc::clone(&dir);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                allocate(&dir, &format!("pod-{}", i))
            })
        })
        .collect();
    let ips: Vec<IpAddr> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let unique: HashSet<_> = ips.iter().collect();
    assert_eq!(unique.len(), WORKERS, "duplicate address handed out: {:?}", ips);
    assert!(!ips.contains(&"10.0.0.10".parse().unwrap()), "ENI primary handed out");

    let store = Store::open(dir.as_path()).unwrap();
    assert_eq!(store.rows().len(), WORKERS);
    for (i, ip) in ips.iter().enumerate() {
        assert_eq!(store.find_by_id(&format!("pod-{}", i), "eth0"), Some(*ip));
    }
}
