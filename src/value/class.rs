// Classes and instances.
//
// An unfrozen class accepts structural modification; freezing happens on
// first instantiation or derivation, after which the class is an immutable
// blueprint. Instances get their field set fixed at allocation time.

use crate::value::{ClassId, StringId, Value};
use ahash::RandomState;
use indexmap::IndexMap;

type MemberMap = IndexMap<StringId, Value, RandomState>;

pub struct CrocClass {
    pub name: StringId,
    pub parent: Option<ClassId>,
    methods: MemberMap,
    fields: MemberMap,
    hidden_fields: MemberMap,
    pub constructor: Option<Value>,
    pub finalizer: Option<Value>,
    frozen: bool,
}

impl CrocClass {
    pub fn new(name: StringId, parent: Option<ClassId>) -> Self {
        CrocClass {
            name,
            parent,
            methods: MemberMap::with_hasher(RandomState::new()),
            fields: MemberMap::with_hasher(RandomState::new()),
            hidden_fields: MemberMap::with_hasher(RandomState::new()),
            constructor: None,
            finalizer: None,
            frozen: false,
        }
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn get_method(&self, name: StringId) -> Option<Value> {
        self.methods.get(&name).copied()
    }

    pub fn get_field(&self, name: StringId) -> Option<Value> {
        self.fields.get(&name).copied()
    }

    pub fn get_hidden_field(&self, name: StringId) -> Option<Value> {
        self.hidden_fields.get(&name).copied()
    }

    /// Structural modification; the caller must reject it on frozen classes.
    pub fn set_method(&mut self, name: StringId, value: Value) {
        self.methods.insert(name, value);
    }

    pub fn set_field(&mut self, name: StringId, value: Value) {
        self.fields.insert(name, value);
    }

    pub fn set_hidden_field(&mut self, name: StringId, value: Value) {
        self.hidden_fields.insert(name, value);
    }

    pub fn has_member(&self, name: StringId) -> bool {
        self.methods.contains_key(&name) || self.fields.contains_key(&name)
    }

    pub fn methods(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.methods.iter().map(|(k, v)| (*k, *v))
    }

    pub fn fields(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.fields.iter().map(|(k, v)| (*k, *v))
    }

    pub fn hidden_fields(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.hidden_fields.iter().map(|(k, v)| (*k, *v))
    }
}

pub struct CrocInstance {
    pub class: ClassId,
    fields: MemberMap,
    hidden_fields: Option<MemberMap>,
}

impl CrocInstance {
    /// The field set is copied from the class blueprint and stays fixed for
    /// the life of the instance.
    pub fn new(class: ClassId, fields: Vec<(StringId, Value)>, hidden: Vec<(StringId, Value)>) -> Self {
        let mut field_map = MemberMap::with_hasher(RandomState::new());
        for (k, v) in fields {
            field_map.insert(k, v);
        }
        let hidden_fields = if hidden.is_empty() {
            None
        } else {
            let mut m = MemberMap::with_hasher(RandomState::new());
            for (k, v) in hidden {
                m.insert(k, v);
            }
            Some(m)
        };
        CrocInstance {
            class,
            fields: field_map,
            hidden_fields,
        }
    }

    pub fn get_field(&self, name: StringId) -> Option<Value> {
        self.fields.get(&name).copied()
    }

    /// Assign an existing field. Instances never grow new fields.
    pub fn set_field(&mut self, name: StringId, value: Value) -> bool {
        match self.fields.get_mut(&name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn has_field(&self, name: StringId) -> bool {
        self.fields.contains_key(&name)
    }

    pub fn get_hidden_field(&self, name: StringId) -> Option<Value> {
        self.hidden_fields.as_ref()?.get(&name).copied()
    }

    pub fn set_hidden_field(&mut self, name: StringId, value: Value) -> bool {
        match self.hidden_fields.as_mut().and_then(|m| m.get_mut(&name)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.fields.iter().map(|(k, v)| (*k, *v))
    }

    pub fn hidden_fields(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.hidden_fields
            .iter()
            .flat_map(|m| m.iter())
            .map(|(k, v)| (*k, *v))
    }

    /// Replace this instance's contents wholesale. Only the deserializer
    /// uses this, to fill a registered shell once its class is known.
    pub(crate) fn deserialize_fill(
        &mut self,
        class: ClassId,
        fields: Vec<(StringId, Value)>,
        hidden: Vec<(StringId, Value)>,
    ) {
        *self = CrocInstance::new(class, fields, hidden);
    }
}
