//! Field-wise round-trip coverage for the codec, over a synthetic schema
//! that exercises every field kind: required/optional scalars, strings,
//! string arrays, and nested messages.

use quickbuild_shared::fbb::{FbbBuilder, MsgArraySource, StrArraySource, StrRef};

mod testfbb {
    quickbuild_shared::fbb_schema! {
        message testing {
            required ri1: i32,
            optional oi2: i32,
            required ri3: i64,
            optional oi4: i64,
            string rs5: str,
            string_opt os6: str,
            string rs7: str,
            string_opt os8: str,
            strings sa9: str,
            strings sa10: str,
        }
        message inner {
            required value: i32,
            string label: str,
        }
        message outer {
            required id: i32,
            fbb_one first: fbb,
            fbb_opt second: fbb,
            fbb_many items: fbb,
        }
    }
}

use testfbb::{inner, outer, testing};

fn serialize(b: &dyn FbbBuilder) -> Vec<u8> {
    let len = b.measure();
    let mut buf = vec![0u8; len];
    assert_eq!(b.serialize_into(&mut buf), len);
    buf
}

#[test]
fn every_field_kind_roundtrips() {
    let sa9: &[&str] = &["item1", "item02", "item003"];
    let mut b = testing::Builder::new();
    b.set_ri1(42);
    b.set_oi2(100);
    b.set_ri3(-200);
    b.set_rs5("foo");
    b.set_os6("loremipsum");
    b.set_rs7("quux");
    b.set_sa9(StrArraySource::Strs(sa9));
    b.set_sa10(StrArraySource::Strs(&[]));

    let buf = serialize(&b);

    let msg = testing::View::from_bytes(&buf);
    assert!(msg.has_oi2());
    assert!(!msg.has_oi4());
    assert!(msg.has_os6());
    assert!(!msg.has_os8());

    assert_eq!(msg.ri1(), 42);
    assert_eq!(msg.oi2(), 100);
    assert_eq!(msg.ri3(), -200);
    assert_eq!(msg.rs5(), b"foo");
    assert_eq!(msg.os6(), Some(&b"loremipsum"[..]));
    assert_eq!(msg.rs7(), b"quux");
    assert_eq!(msg.os8(), None);

    let sa9_back: Vec<&[u8]> = msg.sa9_iter().collect();
    assert_eq!(sa9_back, vec![&b"item1"[..], b"item02", b"item003"]);
    // sa10 was set to an empty array: present, count 0 - not absent.
    assert!(msg.has_sa10());
    assert_eq!(msg.sa10_count(), 0);
}

#[test]
fn measure_matches_serialized_length_for_varied_payloads() {
    for (s5, s7, arr) in [
        ("", "x", vec![]),
        ("a", "bb", vec!["one"]),
        ("padding-probe", "1234567", vec!["", "q", "seven07"]),
        ("exactly8", "exact-15-chars!", vec!["aligned", "to", "eight", "bytes"]),
    ] {
        let arr: Vec<&str> = arr;
        let mut b = testing::Builder::new();
        b.set_ri1(1);
        b.set_ri3(2);
        b.set_rs5(s5);
        b.set_rs7(s7);
        b.set_sa9(StrArraySource::Strs(&arr));
        b.set_sa10(StrArraySource::Strs(&[]));

        let buf = serialize(&b);
        assert_eq!(buf.len(), b.measure());
        assert_eq!(buf.len() % 8, 0, "serialized length must be 8-aligned");

        let msg = testing::View::from_bytes(&buf);
        assert_eq!(msg.rs5(), s5.as_bytes());
        assert_eq!(msg.rs7(), s7.as_bytes());
        assert_eq!(msg.sa9_count() as usize, arr.len());
        for (i, s) in arr.iter().enumerate() {
            assert_eq!(msg.sa9_at(i), s.as_bytes());
        }
    }
}

#[test]
fn empty_string_is_present_not_absent() {
    let mut b = testing::Builder::new();
    b.set_ri1(0);
    b.set_ri3(0);
    b.set_rs5("");
    b.set_os6("");
    b.set_rs7("nonempty");
    b.set_sa9(StrArraySource::Strs(&[]));
    b.set_sa10(StrArraySource::Strs(&[]));

    let buf = serialize(&b);
    let msg = testing::View::from_bytes(&buf);

    // Empty and absent are different things: the empty string has a
    // non-zero relptr pointing at a lone NUL byte, length 0.
    assert_eq!(msg.rs5(), b"");
    assert_eq!(msg.rs5_len(), 0);
    assert!(msg.has_os6());
    assert_eq!(msg.os6(), Some(&b""[..]));
    assert!(!msg.has_os8());
}

#[test]
fn string_sources_agree_on_the_serialized_form() {
    let as_strs: &[&str] = &["alpha", "beta"];
    let as_slices: &[&[u8]] = &[b"alpha", b"beta"];

    let build = |src: StrArraySource| {
        let mut b = testing::Builder::new();
        b.set_ri1(9);
        b.set_ri3(9);
        b.set_rs5("s");
        b.set_rs7("t");
        b.set_sa9(src);
        b.set_sa10(StrArraySource::Strs(&[]));
        serialize(&b)
    };

    let via_strs = build(StrArraySource::Strs(as_strs));
    let via_slices = build(StrArraySource::Slices(as_slices));
    assert_eq!(via_strs, via_slices);

    fn item(idx: usize, _data: *const quickbuild_shared::fbb::c_void) -> StrRef<'static> {
        [&b"alpha"[..], b"beta"][idx].into()
    }
    let via_callback = build(StrArraySource::Callback {
        count: 2,
        item,
        data: std::ptr::null(),
    });
    assert_eq!(via_strs, via_callback);
}

#[test]
fn nested_messages_roundtrip() {
    let mut first = inner::Builder::new();
    first.set_value(1);
    first.set_label("first");

    let mut item_a = inner::Builder::new();
    item_a.set_value(10);
    item_a.set_label("a");
    let mut item_b = inner::Builder::new();
    item_b.set_value(20);
    item_b.set_label("b");

    let items: &[&dyn FbbBuilder] = &[&item_a, &item_b];
    let mut b = outer::Builder::new();
    b.set_id(7);
    b.set_first(&first);
    b.set_items(MsgArraySource::Slice(items));

    let buf = serialize(&b);
    let msg = outer::View::from_bytes(&buf);

    assert_eq!(msg.id(), 7);
    let first_back = inner::View::from_raw(msg.first());
    assert_eq!(first_back.value(), 1);
    assert_eq!(first_back.label(), b"first");

    assert!(!msg.has_second());
    assert!(msg.second().is_none());

    assert_eq!(msg.items_count(), 2);
    let a = inner::View::from_raw(msg.items_at(0));
    let bb = inner::View::from_raw(msg.items_at(1));
    assert_eq!((a.value(), a.label()), (10, &b"a"[..]));
    assert_eq!((bb.value(), bb.label()), (20, &b"b"[..]));
}

#[test]
#[should_panic]
fn tag_mismatch_trips_the_accessor_assertions() {
    let mut b = inner::Builder::new();
    b.set_value(1);
    b.set_label("x");
    let buf = serialize(&b);
    // Viewing an `inner` record as `outer` is a bug, not a runtime error.
    let _ = outer::View::from_bytes(&buf);
}
