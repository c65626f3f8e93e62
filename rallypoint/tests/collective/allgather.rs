use super::helpers::run_collective;
use bytes::Bytes;

#[tokio::test]
async fn test_allgather_every_rank_sees_every_payload() {
    let results = run_collective(5, |ctx| async move {
        let payload = Bytes::from(format!("shard-{}", ctx.rank()));
        let mut op = ctx.allgather(payload, "shards").unwrap();
        op.resolve().await.unwrap().into_values().unwrap()
    })
    .await;

    let expected: Vec<Bytes> = (0..5).map(|r| Bytes::from(format!("shard-{r}"))).collect();
    for values in results {
        assert_eq!(values, expected);
    }
}

#[tokio::test]
async fn test_allgather_large_payload() {
    let results = run_collective(3, |ctx| async move {
        let payload = vec![ctx.rank() as u8; 256 * 1024];
        let mut op = ctx.allgather(payload, "big").unwrap();
        op.resolve().await.unwrap().into_values().unwrap()
    })
    .await;

    for values in results {
        assert_eq!(values.len(), 3);
        for (r, v) in values.iter().enumerate() {
            assert_eq!(v.len(), 256 * 1024);
            assert!(v.iter().all(|b| *b == r as u8));
        }
    }
}

#[tokio::test]
async fn test_single_rank_allgather() {
    let results = run_collective(1, |ctx| async move {
        let mut op = ctx.allgather(Bytes::from_static(b"alone"), "").unwrap();
        op.resolve().await.unwrap()
    })
    .await;
    assert_eq!(results[0].values().unwrap(), &[Bytes::from_static(b"alone")]);
}
