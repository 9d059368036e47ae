//! Integration tests for shared value construction, copying and round trips

use arcbridge_core::{RawValue, Type, TypeRef, Value};

fn int_array() -> TypeRef {
    Type::array(Type::Int32.into_ref())
}

fn round_trip(ty: TypeRef, raw: RawValue) {
    let value = Value::new(ty.clone(), raw.clone()).unwrap();
    assert_eq!(value.to_native(), raw, "round trip through {}", ty);
}

#[test]
fn test_fresh_blocks_have_one_reference() {
    let samples = vec![
        (Type::String.into_ref(), RawValue::from("hello")),
        (int_array(), RawValue::from(vec![1, 2, 3])),
        (Type::hash(Type::Int32.into_ref(), Type::Int32.into_ref()), RawValue::Hash(vec![(1.into(), 2.into())])),
        (Type::tuple(vec![Type::Int32.into_ref(), Type::Bool.into_ref()]), RawValue::from(vec![RawValue::Int(1), RawValue::Bool(true)])),
        (Type::union(vec![Type::Int32.into_ref(), Type::String.into_ref()]), RawValue::from("member")),
    ];
    for (ty, raw) in samples {
        let value = Value::new(ty.clone(), raw).unwrap();
        assert_eq!(value.ref_count(), Some(1), "{}", ty);

        let shared = value.dup();
        assert_eq!(value.ref_count(), Some(2), "{}", ty);
        assert_eq!(shared.data_address(), value.data_address());
        drop(shared);
        assert_eq!(value.ref_count(), Some(1));
    }
}

#[test]
fn test_primitives_are_not_ref_counted() {
    let value = Value::new(Type::Int64.into_ref(), 9).unwrap();
    assert_eq!(value.ref_count(), None);
    assert_eq!(value.dup().get(), RawValue::Int(9));
}

#[test]
fn test_deep_dup_is_independent() {
    let ty = Type::array(int_array());
    let original = Value::new(ty, vec![vec![1, 2], vec![3]]).unwrap();
    let deep = original.deep_dup().unwrap();
    let shallow = original.dup();
    assert_ne!(deep.data_address(), original.data_address());

    let first = original.at(0).unwrap();
    first.as_value().unwrap().set_at(0, 100).unwrap();

    assert_eq!(
        shallow.to_native(),
        RawValue::from(vec![vec![100, 2], vec![3]])
    );
    assert_eq!(deep.to_native(), RawValue::from(vec![vec![1, 2], vec![3]]));
}

#[test]
fn test_set_is_visible_through_dup() {
    let mut value = Value::new(Type::String.into_ref(), "before").unwrap();
    let other = value.dup();
    value.set("after").unwrap();
    assert_eq!(other.get(), RawValue::from("after"));
    assert_eq!(other.address(), value.address());
}

#[test]
fn test_round_trips() {
    round_trip(Type::Int32.into_ref(), RawValue::Int(-7));
    round_trip(Type::UInt64.into_ref(), RawValue::UInt(u64::MAX));
    round_trip(Type::Float64.into_ref(), RawValue::Float(2.5));
    round_trip(Type::Bool.into_ref(), RawValue::Bool(true));
    round_trip(Type::Nil.into_ref(), RawValue::Nil);
    round_trip(Type::String.into_ref(), RawValue::from("héllo wörld"));
    round_trip(Type::String.into_ref(), RawValue::from(""));
    round_trip(int_array(), RawValue::from(vec![5, 6, 7]));
    round_trip(int_array(), RawValue::Array(vec![]));
    round_trip(
        Type::hash(Type::Int32.into_ref(), Type::Int32.into_ref()),
        RawValue::Hash(vec![(1.into(), 10.into()), (2.into(), 20.into())]),
    );
    round_trip(Type::hash(Type::Int32.into_ref(), Type::Int32.into_ref()), RawValue::Hash(vec![]));
    round_trip(
        Type::tuple(vec![Type::Int32.into_ref(), Type::String.into_ref(), Type::Nil.into_ref()]),
        RawValue::Array(vec![1.into(), "two".into(), RawValue::Nil]),
    );
    round_trip(
        Type::named_tuple(vec![("id", Type::Int32.into_ref()), ("name", Type::String.into_ref())]),
        RawValue::Hash(vec![(RawValue::symbol("id"), 1.into()), (RawValue::symbol("name"), "x".into())]),
    );
    round_trip(
        Type::union(vec![Type::Nil.into_ref(), Type::String.into_ref()]),
        RawValue::Nil,
    );
    round_trip(
        Type::array(Type::union(vec![Type::Nil.into_ref(), Type::Int32.into_ref()])),
        RawValue::Array(vec![1.into(), RawValue::Nil, 3.into()]),
    );
}

#[test]
fn test_union_first_match() {
    let ty = Type::union(vec![Type::Bool.into_ref(), Type::Int32.into_ref()]);
    let value = Value::new(ty, 1).unwrap();
    assert_eq!(value.variant_type().unwrap(), Type::Bool.into_ref());
    assert_eq!(value.get(), RawValue::Bool(true));

    let ty = Type::union(vec![Type::Bool.into_ref(), Type::Int32.into_ref()]);
    let value = Value::new(ty.clone(), 5).unwrap();
    assert_eq!(value.variant_index().unwrap(), 0);

    // Bool rejects floats, Int32 takes whole ones
    let value = Value::new(ty, RawValue::Float(2.0)).unwrap();
    assert_eq!(value.variant_index().unwrap(), 1);
    assert_eq!(value.get(), RawValue::Int(2));
}

#[test]
fn test_deep_dup_keeps_union_member() {
    let ty = Type::union(vec![Type::Bool.into_ref(), Type::Int32.into_ref()]);
    let value = Value::new(ty.clone(), true).unwrap();

    // select the Int32 member in place, the way foreign code writes a union
    let payload = value.data_address().unwrap() as *mut u8;
    unsafe {
        *payload = 1;
        std::ptr::write_unaligned(payload.add(1) as *mut i32, 5);
    }
    assert_eq!(value.variant_index().unwrap(), 1);

    let copy = value.deep_dup().unwrap();
    assert_ne!(copy.address(), value.address());
    assert_eq!(copy.variant_index().unwrap(), 1);
    assert_eq!(copy.get(), RawValue::Int(5));

    let list = Value::new(Type::array(ty), vec![RawValue::Ref(value.dup())]).unwrap();
    let copied_list = list.deep_dup().unwrap();
    let element = copied_list.at(0).unwrap();
    let element = element.as_value().unwrap();
    assert_ne!(element.address(), value.address());
    assert_eq!(element.variant_index().unwrap(), 1);
    assert_eq!(element.get(), RawValue::Int(5));
}

#[test]
fn test_union_shares_container_member() {
    let ty = Type::union(vec![Type::Int32.into_ref(), int_array()]);
    let value = Value::new(ty, vec![1, 2]).unwrap();
    assert_eq!(value.variant_index().unwrap(), 1);
    let copy = value.deep_dup().unwrap();

    let member = value.get();
    member.as_value().unwrap().push(3).unwrap();

    assert_eq!(value.to_native(), RawValue::from(vec![1, 2, 3]));
    assert_eq!(copy.to_native(), RawValue::from(vec![1, 2]));
}

#[test]
fn test_containers() {
    let list = Value::new(int_array(), vec![1, 2]).unwrap();
    list.push(3).unwrap();
    assert_eq!(list.len().unwrap(), 3);
    assert_eq!(list.at(-1).unwrap(), RawValue::Int(3));
    assert!(list.at(3).is_err());

    let map = Value::new(
        Type::hash(Type::String.into_ref(), Type::Int32.into_ref()),
        RawValue::Hash(vec![]),
    )
    .unwrap();
    map.insert("a", 1).unwrap();
    map.insert("a", 2).unwrap();
    assert_eq!(map.len().unwrap(), 1);
    assert_eq!(map.lookup("a").unwrap(), Some(RawValue::Int(2)));
    assert_eq!(map.lookup("b").unwrap(), None);
}
