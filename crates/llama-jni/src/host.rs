//! Host-side collaborators: the `IntVar` position cursor and the
//! `LogManager.print` log sink.

use jni::objects::{GlobalRef, JClass, JObject, JValue};
use jni::{JNIEnv, JavaVM};
use llama_bridge::{BridgeError, LogSink, PositionCursor};

pub const LOG_MANAGER_CLASS: &str = "com/llamabridge/jni/LogManager";

/// `IntVar` instance passed by the host: an `int value` field and a
/// `void inc()` method.
pub struct IntVarCursor<'a, 'local> {
    env: &'a mut JNIEnv<'local>,
    obj: &'a JObject<'local>,
}

impl<'a, 'local> IntVarCursor<'a, 'local> {
    pub fn new(env: &'a mut JNIEnv<'local>, obj: &'a JObject<'local>) -> Self {
        Self { env, obj }
    }
}

fn jni_err(e: jni::errors::Error) -> BridgeError {
    BridgeError::Other(format!("IntVar: {e}"))
}

impl PositionCursor for IntVarCursor<'_, '_> {
    fn get(&mut self) -> llama_bridge::Result<i32> {
        self.env
            .get_field(self.obj, "value", "I")
            .and_then(|v| v.i())
            .map_err(jni_err)
    }

    fn increment(&mut self) -> llama_bridge::Result<()> {
        self.env
            .call_method(self.obj, "inc", "()V", &[])
            .map(|_| ())
            .map_err(jni_err)
    }
}

/// Forwards formatted lines to the static `LogManager.print(String)`.
pub struct JavaLogSink {
    vm: JavaVM,
    class: GlobalRef,
}

impl JavaLogSink {
    /// Resolve the log manager class. Returns `None` (and clears the
    /// pending `NoClassDefFoundError`) when the host does not provide it.
    pub fn resolve(env: &mut JNIEnv<'_>) -> Option<Self> {
        let class = match env.find_class(LOG_MANAGER_CLASS) {
            Ok(c) => c,
            Err(_) => {
                let _ = env.exception_clear();
                return None;
            }
        };
        let class = env.new_global_ref(class).ok()?;
        let vm = env.get_java_vm().ok()?;
        Some(Self { vm, class })
    }
}

impl LogSink for JavaLogSink {
    fn print(&self, line: &str) {
        let Ok(mut env) = self.vm.attach_current_thread_permanently() else {
            return;
        };
        let Ok(msg) = env.new_string(line) else {
            return;
        };
        let class = <&JClass>::from(self.class.as_obj());
        let result = env.call_static_method(
            class,
            "print",
            "(Ljava/lang/String;)V",
            &[JValue::Object(&msg)],
        );
        if result.is_err() && env.exception_check().unwrap_or(false) {
            let _ = env.exception_clear();
        }
        let _ = env.delete_local_ref(msg);
    }
}
