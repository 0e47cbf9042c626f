use proptest::prelude::*;
use rstage::coerce::{scalar_at, VectorBuilder};
use rstage::path::{NamespaceBindings, PathExpr};
use rstage::qap::{decode_sexp, encode_sexp};
use rstage::tree::Scalar;
use rstage::value::{RValue, ScalarKind};

fn roundtrip(v: &RValue) -> RValue {
    let bytes = encode_sexp(v);
    let (decoded, used) = decode_sexp(&bytes).unwrap();
    assert_eq!(used, bytes.len(), "decoder must consume the whole item");
    decoded
}

// ── SEXP codec ────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn integer_vectors_survive_the_codec(
        v in prop::collection::vec(prop::option::of((i32::MIN + 1)..=i32::MAX), 0..64)
    ) {
        let value = RValue::integer(v);
        prop_assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn logical_vectors_survive_the_codec(v in prop::collection::vec(prop::option::of(any::<bool>()), 0..64)) {
        let value = RValue::logical(v);
        prop_assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn finite_doubles_survive_the_codec(
        v in prop::collection::vec(prop::option::of(prop::num::f64::NORMAL | prop::num::f64::ZERO), 0..32)
    ) {
        let value = RValue::double(v);
        prop_assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn strings_survive_the_codec(
        v in prop::collection::vec(prop::option::of("[a-zA-Z0-9 äöü_.-]{0,16}"), 0..16)
    ) {
        let value = RValue::character(v);
        prop_assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn data_frames_keep_columns_by_name(ids in prop::collection::vec(0i32..1000, 1..20)) {
        let names: Vec<String> = ids.iter().map(|i| format!("n{i}")).collect();
        let frame = RValue::data_frame(vec![
            ("id".to_owned(), RValue::integer(ids.iter().copied().map(Some).collect())),
            ("name".to_owned(), RValue::strings(names.clone())),
        ]);
        let back = roundtrip(&frame);
        prop_assert!(back.is_data_frame());
        prop_assert_eq!(back.column("id").map(RValue::len), Some(ids.len()));
        prop_assert_eq!(back.column("name"), Some(&RValue::strings(names)));
    }

    /// Arbitrary input may be rejected but must never panic.
    #[test]
    fn decoder_survives_garbage(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_sexp(&bytes);
    }
}

// ── Coercion ──────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn in_range_integers_convert_exactly(n in (i32::MIN + 1)..=i32::MAX) {
        let mut b = VectorBuilder::new(ScalarKind::Integer, 2);
        b.push(Some(&Scalar::Int(i64::from(n)))).unwrap();
        b.push(Some(&Scalar::Str(n.to_string()))).unwrap();
        prop_assert_eq!(b.finish(), RValue::integer(vec![Some(n), Some(n)]));
    }

    #[test]
    fn out_of_range_integers_are_rejected(n in prop_oneof![i64::MIN..i64::from(i32::MIN), (i64::from(i32::MAX) + 1)..i64::MAX]) {
        let mut b = VectorBuilder::new(ScalarKind::Integer, 1);
        prop_assert!(b.push(Some(&Scalar::Int(n))).is_err());
    }

    #[test]
    fn character_accepts_only_strings(s in ".{0,12}", n in any::<i64>()) {
        let mut b = VectorBuilder::new(ScalarKind::Character, 1);
        b.push(Some(&Scalar::Str(s.clone()))).unwrap();
        prop_assert_eq!(scalar_at(&b.finish(), 0), Some(Scalar::Str(s)));

        let mut b = VectorBuilder::new(ScalarKind::Character, 1);
        prop_assert!(b.push(Some(&Scalar::Int(n))).is_err());
    }

    #[test]
    fn doubles_pass_through_unchanged(x in prop::num::f64::NORMAL) {
        let mut b = VectorBuilder::new(ScalarKind::Double, 1);
        b.push(Some(&Scalar::Double(x))).unwrap();
        prop_assert_eq!(scalar_at(&b.finish(), 0), Some(Scalar::Double(x)));
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

proptest! {
    /// Compiling arbitrary text either succeeds or reports an error.
    #[test]
    fn path_compiler_never_panics(src in "[a-z/$?*.\\[\\]():'0-9{} ]{0,24}") {
        let _ = PathExpr::compile(&src, &NamespaceBindings::new());
    }
}
