//! Start a local testnet, store a value from one node and read it from another.
//!
//! Run with: cargo run --example testnet -- --nodes 20 "Hello World!"

use std::time::Instant;

use clap::Parser;
use kadnode::{Dht, Id, Testnet};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Value to store
    value: String,
    /// Number of nodes in the testnet
    #[arg(short, long, default_value_t = 10)]
    nodes: usize,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let testnet = Testnet::new(cli.nodes).expect("could not start the testnet");

    let writer = client(&testnet);
    let reader = client(&testnet);

    let key = Id::from_key(cli.value.as_bytes());

    println!("\nStoring {:?} under {key} ...", cli.value);

    let start = Instant::now();
    let put = writer
        .put(key, cli.value.as_bytes())
        .wait()
        .expect("put failed");

    println!(
        "Stored at {} nodes, lookup took {} hops, in {:?}",
        put.store.acknowledgements.len(),
        put.lookup.hops,
        start.elapsed()
    );

    let start = Instant::now();
    let found = reader.get(key).wait().expect("get failed");

    println!(
        "Found {:?} in {:?}",
        String::from_utf8_lossy(&found.values[0]),
        start.elapsed()
    );
}

fn client(testnet: &Testnet) -> Dht {
    let dht = Dht::builder()
        .testnet()
        .bootstrap(&testnet.bootstrap)
        .build()
        .expect("could not start a node");

    dht.bootstrapped();

    dht
}
