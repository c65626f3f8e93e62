use super::helpers::{enter_group, exit_group, fast_config, run_collective};
use bytes::Bytes;
use rallypoint::{OperationGroup, RallyError};

#[tokio::test]
async fn test_series_complete_in_any_submission_order() {
    let results = run_collective(3, |ctx| async move {
        let mut series = vec!["a", "b", "c", "d"];
        series.rotate_left(ctx.rank() as usize);

        let mut ops = Vec::new();
        for s in &series {
            let payload = Bytes::from(format!("{s}{}", ctx.rank()));
            ops.push((s.to_string(), ctx.allgather(payload, *s).unwrap()));
        }
        let mut out = Vec::new();
        for (s, mut op) in ops {
            out.push((s, op.resolve().await.unwrap().into_values().unwrap()));
        }
        out.sort();
        out
    })
    .await;

    for per_rank in results {
        for (s, values) in per_rank {
            let expected: Vec<Bytes> = (0..3).map(|r| Bytes::from(format!("{s}{r}"))).collect();
            assert_eq!(values, expected);
        }
    }
}

#[tokio::test]
async fn test_same_label_different_kinds_are_independent() {
    let results = run_collective(2, |ctx| async move {
        let rank = ctx.rank();
        let mut group = OperationGroup::new();
        group.push(ctx.allgather(vec![rank as u8], "step").unwrap());
        let src = (rank == 0).then(|| Bytes::from_static(b"b"));
        group.push(ctx.broadcast(src, "step").unwrap());
        group.push(ctx.gather(vec![10 + rank as u8], "step").unwrap());
        group.resolve_all().await.unwrap()
    })
    .await;

    assert_eq!(results[0][0].values().unwrap().len(), 2);
    assert_eq!(results[1][1].value().unwrap().as_ref(), b"b");
    assert_eq!(
        results[0][2].values().unwrap(),
        &[Bytes::from_static(&[10]), Bytes::from_static(&[11])]
    );
    assert!(results[1][2].is_absent());
}

#[tokio::test]
async fn test_label_is_reusable_after_completion() {
    let results = run_collective(3, |ctx| async move {
        let mut seen = Vec::new();
        for round in 0..3u8 {
            let mut op = ctx.allgather(vec![round], "loop").unwrap();
            let values = op.resolve().await.unwrap().into_values().unwrap();
            seen.push(values[0][0]);
        }
        seen
    })
    .await;

    for seen in results {
        assert_eq!(seen, vec![0, 1, 2]);
    }
}

#[tokio::test]
async fn test_reuse_while_pending_is_refused() {
    let contexts = enter_group(2, fast_config()).await;

    let mut first = contexts[0].allgather(Bytes::from_static(b"1"), "dup").unwrap();
    let err = contexts[0]
        .allgather(Bytes::from_static(b"2"), "dup")
        .unwrap_err();
    assert!(matches!(err, RallyError::SeriesReuse { ref series, .. } if series == "dup"));

    let mut second = contexts[1].allgather(Bytes::from_static(b"3"), "dup").unwrap();
    assert_eq!(first.resolve().await.unwrap().values().unwrap().len(), 2);
    assert_eq!(
        second.resolve().await.unwrap().values().unwrap(),
        &[Bytes::from_static(b"1"), Bytes::from_static(b"3")]
    );

    exit_group(contexts).await;
}

#[tokio::test]
async fn test_resolve_is_idempotent() {
    let results = run_collective(2, |ctx| async move {
        let mut op = ctx.allgather(vec![ctx.rank() as u8], "twice").unwrap();
        let first = op.resolve().await.unwrap();
        let second = op.resolve().await.unwrap();
        assert!(op.is_ready());
        (first, second)
    })
    .await;

    for (first, second) in results {
        assert_eq!(first, second);
    }
}
