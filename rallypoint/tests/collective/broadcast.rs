use super::helpers::{enter_group, exit_group, fast_config, run_collective};
use bytes::Bytes;
use rallypoint::{OperationKind, RallyError};

#[tokio::test]
async fn test_broadcast_from_rank_zero() {
    let results = run_collective(4, |ctx| async move {
        let payload = (ctx.rank() == 0).then(|| Bytes::from_static(b"weights-v1"));
        let mut op = ctx.broadcast(payload, "weights").unwrap();
        op.resolve().await.unwrap()
    })
    .await;

    for outcome in results {
        assert_eq!(outcome.into_value().unwrap(), "weights-v1");
    }
}

#[tokio::test]
async fn test_broadcast_from_other_root() {
    let results = run_collective(3, |ctx| async move {
        let payload = (ctx.rank() == 1).then(|| Bytes::from_static(b"seed=7"));
        let mut op = ctx.broadcast_from(payload, "seed", 1).unwrap();
        op.resolve().await.unwrap()
    })
    .await;

    for outcome in results {
        assert_eq!(outcome.value().unwrap().as_ref(), b"seed=7");
    }
}

#[tokio::test]
async fn test_broadcast_shape_is_checked_before_sending() {
    let contexts = enter_group(2, fast_config()).await;

    let err = contexts[1]
        .broadcast(Some(Bytes::from_static(b"not mine")), "w")
        .unwrap_err();
    assert!(matches!(
        err,
        RallyError::InvalidContribution {
            kind: OperationKind::Broadcast,
            ..
        }
    ));
    let err = contexts[0].broadcast(None, "w").unwrap_err();
    assert!(matches!(err, RallyError::InvalidContribution { .. }));
    let err = contexts[0]
        .broadcast_from(Some(Bytes::from_static(b"x")), "w", 5)
        .unwrap_err();
    assert!(matches!(err, RallyError::InvalidContribution { .. }));

    // Nothing reached the chief, so the series is still free.
    let mut a = contexts[0]
        .broadcast(Some(Bytes::from_static(b"ok")), "w")
        .unwrap();
    let mut b = contexts[1].broadcast(None, "w").unwrap();
    assert_eq!(a.resolve().await.unwrap().into_value().unwrap(), "ok");
    assert_eq!(b.resolve().await.unwrap().into_value().unwrap(), "ok");

    exit_group(contexts).await;
}
