use super::helpers::{fast_config, port_of};
use bytes::Bytes;
use rallypoint::{DistributedContext, GroupDescriptor, Outcome, RallyError};
use std::thread;

/// Three ranks on OS threads driving the blocking API end to end.
#[test]
fn test_blocking_three_rank_scenario() {
    let chief = DistributedContext::enter(
        GroupDescriptor::new(0, 3, "127.0.0.1", "0").unwrap(),
        fast_config(),
    )
    .unwrap();
    let port = port_of(&chief.chief_addr().unwrap());

    let workers: Vec<_> = (1..3)
        .map(|rank| {
            let port = port.clone();
            thread::spawn(move || {
                let group = GroupDescriptor::new(rank, 3, "127.0.0.1", port).unwrap();
                let ctx = DistributedContext::enter(group, fast_config()).unwrap();
                let outcomes = run_rank(&ctx);
                ctx.exit().unwrap();
                outcomes
            })
        })
        .collect();

    let chief_outcomes = run_rank(&chief);
    let mut all = vec![chief_outcomes];
    for w in workers {
        all.push(w.join().unwrap());
    }
    chief.exit().unwrap();

    let gathered: Vec<Bytes> = ["chief", "worker1", "worker 2"]
        .into_iter()
        .map(Bytes::from)
        .collect();
    let everyone: Vec<Bytes> = ["ag0", "ag1", "ag2"].into_iter().map(Bytes::from).collect();
    assert_eq!(all[0][0], Outcome::Values(gathered));
    for (rank, outcomes) in all.iter().enumerate() {
        if rank != 0 {
            assert!(outcomes[0].is_absent());
        }
        assert_eq!(outcomes[1].value().unwrap().as_ref(), b"bchief");
        assert_eq!(outcomes[2].values().unwrap(), everyone.as_slice());
    }
}

fn run_rank(ctx: &DistributedContext) -> Vec<Outcome> {
    let name = match ctx.rank() {
        0 => "chief".to_string(),
        1 => "worker1".to_string(),
        r => format!("worker {r}"),
    };
    let mut gather = ctx.gather(name, "x").unwrap();
    let src = (ctx.rank() == 0).then(|| Bytes::from_static(b"bchief"));
    let mut bcast = ctx.broadcast(src, "x").unwrap();
    let mut all = ctx.allgather(format!("ag{}", ctx.rank()), "x").unwrap();

    let g = gather.wait().unwrap();
    assert_eq!(gather.wait().unwrap(), g);
    vec![g, bcast.wait().unwrap(), all.wait().unwrap()]
}

#[test]
fn test_blocking_context_reports_layout() {
    let group = GroupDescriptor::new(0, 1, "127.0.0.1", "0")
        .unwrap()
        .with_local(0, 1)
        .with_cross(0, 1);
    let ctx = DistributedContext::enter(group, fast_config()).unwrap();
    assert_eq!((ctx.rank(), ctx.size()), (0, 1));
    assert_eq!((ctx.local_rank(), ctx.local_size()), (0, 1));
    assert_eq!((ctx.cross_rank(), ctx.cross_size()), (0, 1));
    let mut op = ctx.gather(Bytes::from_static(b"x"), "").unwrap();
    assert_eq!(op.wait().unwrap().values().unwrap().len(), 1);
    ctx.exit().unwrap();
}

#[test]
fn test_blocking_enter_fails_without_chief() {
    let group = GroupDescriptor::new(1, 2, "127.0.0.1", "1").unwrap();
    let config = rallypoint::RallyConfig {
        connect_timeout: std::time::Duration::from_millis(100),
        connect_retry_interval: std::time::Duration::from_millis(20),
        ..fast_config()
    };
    let err = DistributedContext::enter(group, config).err().unwrap();
    assert!(matches!(err, RallyError::ChiefUnreachable { .. }));
}
