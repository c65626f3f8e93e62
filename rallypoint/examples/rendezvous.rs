//! One gather, one broadcast and one all-gather across a launched group.
//!
//! Start one process per rank with the launcher environment set:
//!
//! ```bash
//! RANK=0 SIZE=3 CHIEF_IP=127.0.0.1 cargo run --example rendezvous &
//! RANK=1 SIZE=3 CHIEF_IP=127.0.0.1 cargo run --example rendezvous &
//! RANK=2 SIZE=3 CHIEF_IP=127.0.0.1 cargo run --example rendezvous
//! ```
//!
//! Set `RUST_LOG=rallypoint=debug` to watch the chief's bookkeeping.

use bytes::Bytes;
use rallypoint::{DistributedContext, Outcome};
use tracing_subscriber::EnvFilter;

fn main() -> rallypoint::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let ctx = DistributedContext::from_env()?;
    let rank = ctx.rank();

    let hostname = format!("rank-{rank}@pid-{}", std::process::id());
    let mut names = ctx.gather(hostname.clone(), "hostnames")?;

    let plan = (rank == 0).then(|| Bytes::from_static(b"lr=0.1 epochs=3"));
    let mut config = ctx.broadcast(plan, "config")?;

    let mut peers = ctx.allgather(hostname, "peers")?;

    match names.wait()? {
        Outcome::Values(all) => {
            for (r, name) in all.iter().enumerate() {
                println!("rank {rank}: gathered [{r}] {}", String::from_utf8_lossy(name));
            }
        }
        _ => println!("rank {rank}: gather delivered to rank 0"),
    }
    if let Some(plan) = config.wait()?.value() {
        println!("rank {rank}: config {}", String::from_utf8_lossy(plan));
    }
    if let Some(all) = peers.wait()?.values() {
        println!("rank {rank}: {} peers", all.len());
    }

    ctx.exit()
}
