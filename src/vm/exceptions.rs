// Standard exception classes and throw helpers.
//
// Error kinds are Croc-level classes rooted at Throwable, split into
// Exception (recoverable) and Error (not expected to be caught). The Rust
// side only carries the one-byte ExecError signal; the thrown instance
// lives in the VM's exception slot.

use crate::gc::GcId;
use crate::value::{ClassId, CrocClass, CrocInstance, StringId, Value};
use crate::vm::{CrocVm, ExecError};

#[derive(Default, Clone, Copy)]
pub struct ExceptionClasses {
    pub throwable: ClassId,
    pub exception: ClassId,
    pub error: ClassId,
    pub type_error: ClassId,
    pub value_error: ClassId,
    pub range_error: ClassId,
    pub field_error: ClassId,
    pub bounds_error: ClassId,
    pub import_error: ClassId,
    pub io_error: ClassId,
    pub eof_error: ClassId,
    pub state_error: ClassId,
    pub syntax_error: ClassId,
    pub lookup_error: ClassId,
    pub not_implemented_error: ClassId,
    pub runtime_error: ClassId,
}

/// Field names every Throwable instance carries.
pub(crate) struct ThrowableFields {
    pub msg: StringId,
    pub value: StringId,
    pub cause: StringId,
    pub location: StringId,
}

impl CrocVm {
    pub(crate) fn install_exception_classes(&mut self) {
        let msg = self.intern("msg");
        let value = self.intern("value");
        let cause = self.intern("cause");
        let location = self.intern("location");
        for id in [msg, value, cause, location] {
            self.pool.fix(GcId::String(id));
        }
        self.throwable_fields = ThrowableFields {
            msg,
            value,
            cause,
            location,
        };

        let throwable = self.define_exception_class("Throwable", None);
        let exception = self.define_exception_class("Exception", Some(throwable));
        let error = self.define_exception_class("Error", Some(throwable));

        let mut classes = ExceptionClasses {
            throwable,
            exception,
            error,
            ..Default::default()
        };

        classes.type_error = self.define_exception_class("TypeError", Some(error));
        classes.value_error = self.define_exception_class("ValueError", Some(exception));
        classes.range_error = self.define_exception_class("RangeError", Some(classes.value_error));
        classes.field_error = self.define_exception_class("FieldError", Some(exception));
        classes.bounds_error = self.define_exception_class("BoundsError", Some(exception));
        classes.import_error = self.define_exception_class("ImportError", Some(exception));
        classes.io_error = self.define_exception_class("IOError", Some(exception));
        classes.eof_error = self.define_exception_class("EOFError", Some(classes.io_error));
        classes.state_error = self.define_exception_class("StateError", Some(exception));
        classes.syntax_error = self.define_exception_class("SyntaxError", Some(exception));
        classes.lookup_error = self.define_exception_class("LookupError", Some(exception));
        classes.not_implemented_error =
            self.define_exception_class("NotImplementedError", Some(error));
        classes.runtime_error = self.define_exception_class("RuntimeError", Some(error));

        self.exc = classes;
    }

    fn define_exception_class(&mut self, name: &str, parent: Option<ClassId>) -> ClassId {
        let name_id = self.intern(name);
        let mut class = CrocClass::new(name_id, parent);
        if parent.is_none() {
            // The root class declares the instance fields; subclasses
            // inherit them through the chain at instantiation.
            let f = &self.throwable_fields;
            class.set_field(f.msg, Value::null());
            class.set_field(f.value, Value::null());
            class.set_field(f.cause, Value::null());
            class.set_field(f.location, Value::null());
        }
        class.freeze();
        let id = self.pool.create_class(&mut self.gc, class);
        self.pool.fix(GcId::Class(id));
        let class_value = Value::class(id);
        let ns = self.globals;
        if let Some(g) = self.pool.namespace_mut(ns) {
            g.set(name_id, class_value);
        }
        id
    }

    /// Build an exception instance without running any constructor.
    pub(crate) fn make_exception(&mut self, class: ClassId, msg: &str) -> Value {
        let msg_value = self.new_string(msg);
        let location = self.current_location();
        let f = &self.throwable_fields;
        let fields = vec![
            (f.msg, msg_value),
            (f.value, Value::null()),
            (f.cause, Value::null()),
            (f.location, location),
        ];
        let iid = self
            .pool
            .create_instance(&mut self.gc, CrocInstance::new(class, fields, Vec::new()));
        Value::instance(iid)
    }

    /// Location record for the currently-executing instruction:
    /// [function name, line] or null outside any frame.
    pub(crate) fn current_location(&mut self) -> Value {
        let tid = self.current_thread;
        let Some(thread) = self.pool.thread(tid) else {
            return Value::null();
        };
        let Some(ar) = thread.act_records.last() else {
            return Value::null();
        };
        let func = ar.func;
        let pc = ar.pc.saturating_sub(1);
        let (name, line) = match self.pool.function(func) {
            Some(f) => {
                let name = f.name;
                let line = f
                    .script_def()
                    .and_then(|d| self.pool.funcdef(d))
                    .map(|d| d.line_at(pc))
                    .unwrap_or(0);
                (name, line)
            }
            None => return Value::null(),
        };
        let arr = self
            .pool
            .create_array_from(&mut self.gc, vec![Value::string(name), Value::int(line as i64)]);
        Value::array(arr)
    }

    // ============ Throwing ============

    /// Throw an arbitrary value. Non-instance values are wrapped in an
    /// Exception instance (carried in its `value` field) so cause chaining
    /// works uniformly. An exception thrown while another is unwinding
    /// replaces it and records the prior one as its cause.
    pub(crate) fn throw_value(&mut self, value: Value) -> ExecError {
        let exc_value = if value.is_instance() {
            value
        } else {
            let class = self.exc.exception;
            let wrapped = self.make_exception(class, "");
            if let Some(iid) = wrapped.as_instance_id() {
                let vfield = self.throwable_fields.value;
                if let Some(inst) = self.pool.instance_mut(iid) {
                    inst.set_field(vfield, value);
                }
            }
            wrapped
        };

        if self.is_unwinding && !self.exception.is_null() {
            let prior = self.exception;
            if let Some(iid) = exc_value.as_instance_id() {
                let cfield = self.throwable_fields.cause;
                if let Some(inst) = self.pool.instance_mut(iid) {
                    inst.set_field(cfield, prior);
                }
            }
        }

        self.exception = exc_value;
        self.is_unwinding = true;
        ExecError::Exception
    }

    pub(crate) fn throw_class(&mut self, class: ClassId, msg: String) -> ExecError {
        let inst = self.make_exception(class, &msg);
        self.throw_value(inst)
    }

    pub(crate) fn type_error(&mut self, msg: String) -> ExecError {
        let c = self.exc.type_error;
        self.throw_class(c, msg)
    }

    pub(crate) fn value_error(&mut self, msg: String) -> ExecError {
        let c = self.exc.value_error;
        self.throw_class(c, msg)
    }

    pub(crate) fn range_error(&mut self, msg: String) -> ExecError {
        let c = self.exc.range_error;
        self.throw_class(c, msg)
    }

    pub(crate) fn bounds_error(&mut self, msg: String) -> ExecError {
        let c = self.exc.bounds_error;
        self.throw_class(c, msg)
    }

    pub(crate) fn field_error(&mut self, msg: String) -> ExecError {
        let c = self.exc.field_error;
        self.throw_class(c, msg)
    }

    pub(crate) fn state_error(&mut self, msg: String) -> ExecError {
        let c = self.exc.state_error;
        self.throw_class(c, msg)
    }

    pub(crate) fn lookup_error(&mut self, msg: String) -> ExecError {
        let c = self.exc.lookup_error;
        self.throw_class(c, msg)
    }

    pub(crate) fn runtime_error(&mut self, msg: String) -> ExecError {
        let c = self.exc.runtime_error;
        self.throw_class(c, msg)
    }

    /// Non-recoverable VM failure; the embedder should dispose the VM.
    pub(crate) fn fatal(&mut self, msg: String) -> ExecError {
        self.fatal_message = msg;
        ExecError::Fatal
    }

    /// Message of the current exception, for host-side diagnostics.
    pub fn exception_message(&self) -> String {
        let Some(iid) = self.exception.as_instance_id() else {
            return format!("{:?}", self.exception);
        };
        let Some(inst) = self.pool.instance(iid) else {
            return String::new();
        };
        let class_name = self
            .pool
            .class(inst.class)
            .map(|c| self.pool.str_of(c.name).to_string())
            .unwrap_or_default();
        let msg = inst
            .get_field(self.throwable_fields.msg)
            .and_then(|v| v.as_string_id())
            .map(|s| self.pool.str_of(s).to_string())
            .unwrap_or_default();
        format!("{}: {}", class_name, msg)
    }
}
