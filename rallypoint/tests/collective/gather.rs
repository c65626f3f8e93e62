use super::helpers::run_collective;
use bytes::Bytes;
use rallypoint::Outcome;

#[tokio::test]
async fn test_gather_to_rank_zero() {
    let results = run_collective(4, |ctx| async move {
        let payload = format!("from-{}", ctx.rank());
        let mut op = ctx.gather(payload, "grads").unwrap();
        op.resolve().await.unwrap()
    })
    .await;

    let expected: Vec<Bytes> = (0..4).map(|r| Bytes::from(format!("from-{r}"))).collect();
    assert_eq!(results[0], Outcome::Values(expected));
    for outcome in &results[1..] {
        assert!(outcome.is_absent());
    }
}

#[tokio::test]
async fn test_gather_to_other_root() {
    let results = run_collective(3, |ctx| async move {
        let payload = vec![ctx.rank() as u8; 2];
        let mut op = ctx.gather_to(payload, "to-two", 2).unwrap();
        op.resolve().await.unwrap()
    })
    .await;

    assert!(results[0].is_absent());
    assert!(results[1].is_absent());
    let values = results[2].values().unwrap();
    assert_eq!(values.len(), 3);
    for (r, v) in values.iter().enumerate() {
        assert_eq!(v.as_ref(), &[r as u8, r as u8]);
    }
}

#[tokio::test]
async fn test_gather_accepts_empty_payloads() {
    let results = run_collective(2, |ctx| async move {
        let mut op = ctx.gather(Bytes::new(), "empty").unwrap();
        op.resolve().await.unwrap()
    })
    .await;
    assert_eq!(results[0], Outcome::Values(vec![Bytes::new(), Bytes::new()]));
}
