// Value semantics: equality, truthiness, interning, hashing.

use super::*;

#[test]
fn distinct_value_types_are_never_equal() {
    // No metamethod machinery is even reachable here: these are raw values.
    let pairs = [
        (Value::null(), Value::bool(false)),
        (Value::null(), Value::int(0)),
        (Value::bool(false), Value::int(0)),
        (Value::int(0), Value::float(0.0)),
        (Value::int(1), Value::float(1.0)),
    ];
    for (a, b) in pairs {
        assert!(!a.raw_equal(&b), "{:?} must not equal {:?}", a, b);
        assert!(!b.raw_equal(&a));
    }
}

#[test]
fn reference_equality_is_identity() {
    let mut vm = new_vm();
    let t1 = vm.new_table();
    let t2 = vm.new_table();
    assert!(t1.raw_equal(&t1));
    assert!(!t1.raw_equal(&t2));
}

#[test]
fn exactly_five_values_are_falsy() {
    let falsy = [
        Value::null(),
        Value::bool(false),
        Value::int(0),
        Value::float(0.0),
        Value::float(-0.0),
    ];
    for v in falsy {
        assert!(v.is_falsy(), "{:?} should be falsy", v);
    }

    let mut vm = new_vm();
    let truthy = [
        Value::bool(true),
        Value::int(1),
        Value::int(-1),
        Value::float(f64::NAN),
        Value::float(0.001),
        vm.new_string(""),
        vm.new_table(),
        vm.new_array(0),
    ];
    for v in truthy {
        assert!(v.is_truthy(), "{:?} should be truthy", v);
    }
}

#[test]
fn strings_are_interned() {
    let mut vm = new_vm();
    let a = vm.new_string("hello world");
    let b = vm.new_string("hello world");
    assert!(a.is_identical(&b), "same bytes must intern to one object");

    let c = vm.new_string("hello");
    assert!(!a.is_identical(&c));
}

#[test]
fn interned_strings_carry_precomputed_hash_and_length() {
    let mut vm = new_vm();
    let v = vm.new_string("héllo");
    let id = v.as_string_id().unwrap();
    let s = vm.pool().string(id).unwrap();
    assert_eq!(s.cp_len(), 5);
    assert_eq!(s.byte_len(), 6);
    assert_ne!(s.hash(), 0);
}

#[test]
fn table_keys_follow_value_equality() {
    let mut vm = new_vm();
    let t = vm.new_table();
    vm.table_set(t, Value::int(1), Value::int(100)).unwrap();
    // Int 1 and Float 1.0 are different keys.
    vm.table_set(t, Value::float(1.0), Value::int(200)).unwrap();
    assert_eq!(vm.table_get(t, Value::int(1)).unwrap(), Value::int(100));
    assert_eq!(vm.table_get(t, Value::float(1.0)).unwrap(), Value::int(200));

    // Interned string keys hit the same slot.
    let k1 = vm.new_string("key");
    let k2 = vm.new_string("key");
    vm.table_set(t, k1, Value::int(7)).unwrap();
    assert_eq!(vm.table_get(t, k2).unwrap(), Value::int(7));
}

#[test]
fn nan_and_null_table_keys_are_rejected() {
    let mut vm = new_vm();
    let t = vm.new_table();
    assert!(vm.table_set(t, Value::float(f64::NAN), Value::int(1)).is_err());
    vm.catch_exception();
    assert!(vm.table_set(t, Value::null(), Value::int(1)).is_err());
    vm.catch_exception();
}
