//! Property-based tests for the key layout.
//!
//! # Tested Invariants
//!
//! - Byte order of item keys equals (ready time, uniquifier) order
//! - A queue's scope prefix never matches another queue's items
//! - Registry keys never fall inside an item scope
//! - Identifiers survive the base-36 encoding

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::engine::key::{
        from_base36, item_suffix, parse_registry_key, parse_scoped, registry_key, scope_prefix,
        scoped_item_key, to_base36,
    };

    fn uniquifier_strategy() -> impl Strategy<Value = [u8; 4]> {
        any::<[u8; 4]>()
    }

    proptest! {
        /// Invariant: key order is delivery order inside one queue.
        #[test]
        fn item_order_matches_ready_time(
            id in any::<u64>(),
            a in any::<u64>(),
            b in any::<u64>(),
            ua in uniquifier_strategy(),
            ub in uniquifier_strategy(),
        ) {
            let ka = scoped_item_key(id, a, ua);
            let kb = scoped_item_key(id, b, ub);
            prop_assert_eq!(ka.cmp(&kb), (a, ua).cmp(&(b, ub)));
            prop_assert_eq!(item_suffix(a, ua).cmp(&item_suffix(b, ub)), (a, ua).cmp(&(b, ub)));
        }

        /// Invariant: a scan over one queue's prefix sees only its own items.
        #[test]
        fn scopes_do_not_nest(
            a in any::<u64>(),
            b in any::<u64>(),
            ready_at in any::<u64>(),
            u in uniquifier_strategy(),
        ) {
            prop_assume!(a != b);
            let prefix = scope_prefix(a);
            prop_assert!(!scoped_item_key(b, ready_at, u).starts_with(&prefix));
            prop_assert!(!registry_key(b).starts_with(&prefix));
        }

        /// Invariant: decoding returns what was encoded.
        #[test]
        fn keys_decode(id in any::<u64>(), ready_at in any::<u64>(), u in uniquifier_strategy()) {
            prop_assert_eq!(from_base36(to_base36(id).as_bytes()), Some(id));
            prop_assert_eq!(parse_registry_key(&registry_key(id)).ok(), Some(id));

            let key = scoped_item_key(id, ready_at, u);
            prop_assert_eq!(parse_scoped(&key, scope_prefix(id).len()).ok(), Some(ready_at));
        }
    }
}
