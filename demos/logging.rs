//! Watch a node's routing table fill up, with every log line of the actor.
//!
//! Run with: cargo run --example logging

use std::thread;
use std::time::Duration;

use kadnode::{Dht, RouteTableEvent, Testnet};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_thread_names(true)
        .with_target(true)
        .with_span_events(FmtSpan::FULL)
        .compact()
        .init();

    let testnet = Testnet::new(5).expect("could not start the testnet");

    let dht = Dht::builder()
        .testnet()
        .bootstrap(&testnet.bootstrap)
        .build()
        .expect("could not start a node");

    let events = dht.subscribe().expect("node is running");

    thread::spawn(move || {
        for event in events.iter() {
            match event {
                RouteTableEvent::ContactAdded(contact) => {
                    println!("+ {} at {}", contact.id(), contact.address())
                }
                RouteTableEvent::ContactRemoved(contact) => {
                    println!("- {} at {}", contact.id(), contact.address())
                }
                other => println!("  {other:?}"),
            }
        }
    });

    dht.bootstrapped();

    thread::sleep(Duration::from_secs(1));

    let info = dht.info().expect("node is running");
    println!(
        "\nRouting table: {} contacts in {} buckets",
        info.routing_table_size(),
        info.buckets()
    );
}
