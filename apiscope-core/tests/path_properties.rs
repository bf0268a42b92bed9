use apiscope_core::config::PolicyConfig;
use apiscope_core::path::{PathInferrer, PatternCache};
use proptest::prelude::*;

fn inferrer() -> PathInferrer {
    PathInferrer::from_config(&PolicyConfig::default())
}

// ── Inference is deterministic and its pattern matches the source path ────

proptest! {
    #[test]
    fn pattern_matches_its_source_path(
        segs in prop::collection::vec("[a-zA-Z0-9._~-]{1,12}", 0..6),
        trailing in any::<bool>()
    ) {
        let mut path = format!("/{}", segs.join("/"));
        if trailing && !segs.is_empty() {
            path.push('/');
        }
        let inferrer = inferrer();
        let first = inferrer.infer(&path).unwrap();
        let second = inferrer.infer(&path).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(
            PatternCache::default().is_match(&first.pattern, &path),
            "{} does not match {}",
            first.pattern,
            path
        );
    }
}

// ── Paths differing only in identifier segments share one template ────────

proptest! {
    #[test]
    fn identifier_segments_share_a_template(
        parts in prop::collection::vec(
            (any::<bool>(), "[a-z]{3,10}", 0u64..1_000_000_000, 0u64..1_000_000_000),
            1..6
        )
    ) {
        prop_assume!(parts.last().map(|p| p.1 != "graphql").unwrap_or(true));
        let build = |pick_second: bool| {
            parts
                .iter()
                .map(|(is_id, word, a, b)| match (*is_id, pick_second) {
                    (true, false) => a.to_string(),
                    (true, true) => b.to_string(),
                    (false, _) => word.clone(),
                })
                .collect::<Vec<_>>()
                .join("/")
        };
        let left = format!("/{}", build(false));
        let right = format!("/{}", build(true));

        let inferrer = inferrer();
        let l = inferrer.infer(&left).unwrap();
        let r = inferrer.infer(&right).unwrap();
        prop_assert_eq!(&l.path, &r.path);
        prop_assert_eq!(l.param_count, parts.iter().filter(|p| p.0).count());

        let cache = PatternCache::default();
        prop_assert!(cache.is_match(&l.pattern, &right));
        prop_assert!(cache.is_match(&r.pattern, &left));
    }
}

#[test]
fn users_orders_example() {
    let order = "3fa85f64-5717-4562-b3fc-2c963f66afa6";
    let t = inferrer()
        .infer(&format!("/users/1234/orders/{}", order))
        .unwrap();
    assert_eq!(t.path, "/users/{param1}/orders/{param2}");

    let cache = PatternCache::default();
    assert!(cache.is_match(&t.pattern, &format!("/users/77/orders/{}", order)));
    assert!(!cache.is_match(&t.pattern, &format!("/users/1234/items/{}", order)));
}
