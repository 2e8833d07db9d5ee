//! End to end tests over a local [Testnet].
//!
//! Run with: cargo test --test testnet

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kadnode::{Dht, Id, MemoryValueStore, OperationError, Testnet, ValueStore};

fn node(testnet: &Testnet) -> Dht {
    let dht = Dht::builder()
        .testnet()
        .bootstrap(&testnet.bootstrap)
        .build()
        .unwrap();

    assert!(dht.bootstrapped());

    dht
}

#[test]
fn values_outlive_the_writer() {
    let testnet = Testnet::new(10).unwrap();

    let mut writer = node(&testnet);
    let reader = node(&testnet);

    let key = Id::from_key(b"values_outlive_the_writer");
    writer.put(key, b"persisted").wait().unwrap();
    writer.shutdown();

    let found = reader.get(key).wait().unwrap();

    assert_eq!(&*found.values[0], b"persisted");
    assert!(!found.lookup.responded.is_empty());
}

#[test]
fn concurrent_operations() {
    let testnet = Testnet::new(10).unwrap();
    let dht = node(&testnet);

    let keys = (0..5_u8)
        .map(|i| Id::from_key(&[b'k', i]))
        .collect::<Vec<_>>();

    let puts = keys
        .iter()
        .map(|key| dht.put(*key, key.as_bytes()))
        .collect::<Vec<_>>();

    for put in puts {
        put.wait().unwrap();
    }

    let gets = keys.iter().map(|key| dht.get(*key)).collect::<Vec<_>>();

    for (key, get) in keys.iter().zip(gets) {
        let found = get.wait().unwrap();
        assert_eq!(&*found.values[0], key.as_bytes());
    }
}

#[test]
fn values_are_forwarded_to_closer_newcomers() {
    let testnet = Testnet::new(10).unwrap();

    // The writer doesn't store the value itself, so keep it far from the key.
    let key = Id::random();
    let writer = Dht::builder()
        .testnet()
        .id(key.with_bit(0, !key.bit(0)))
        .bootstrap(&testnet.bootstrap)
        .build()
        .unwrap();
    assert!(writer.bootstrapped());

    writer.put(key, b"forwarded").wait().unwrap();

    // A node whose id is the key is closer to it than anyone.
    let store = Arc::new(MemoryValueStore::default());
    let newcomer = Dht::builder()
        .testnet()
        .id(key)
        .value_store(store.clone())
        .bootstrap(&testnet.bootstrap)
        .build()
        .unwrap();
    assert!(newcomer.bootstrapped());

    let mut forwarded = None;
    for _ in 0..200 {
        forwarded = store.get(&key);
        if forwarded.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(forwarded.as_deref(), Some(&b"forwarded"[..]));
}

#[test]
fn unreachable_bootstrap() {
    let dht = Dht::builder()
        .testnet()
        .request_timeout(Duration::from_millis(100))
        .bootstrap(&["127.0.0.1:9"])
        .build()
        .unwrap();

    assert!(!dht.bootstrapped());

    let result = dht.ping("127.0.0.1:9".parse().unwrap()).wait();
    assert!(matches!(result, Err(OperationError::PingTimeout(_))));

    let lookup = dht.lookup(Id::random()).wait().unwrap();
    assert!(lookup.responded.is_empty());
}
