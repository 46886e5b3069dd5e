//! Runtime-library natives
//!
//! Natives never suspend. They are resolved by name at link time; the ones
//! flagged `blocking` stall the OS thread they run on and are reported by
//! verification when called on a fiber.

use super::engine::Engine;
use super::ExecError;
use crate::channel::{Channel, ChannelConfig, OverflowPolicy};
use crate::fiber::Fiber;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What a native can reach
pub struct NativeContext<'a> {
    /// The engine running the calling program
    pub engine: &'a Arc<Engine>,
}

/// Native function signature
pub type NativeFn = fn(&NativeContext<'_>, &[Value]) -> Result<Value, ExecError>;

/// A registered native
#[derive(Clone, Copy)]
pub struct NativeEntry {
    /// Implementation
    pub func: NativeFn,
    /// Blocks the calling OS thread
    pub blocking: bool,
}

/// Native functions by name
#[derive(Clone, Default)]
pub struct NativeRegistry {
    entries: FxHashMap<String, NativeEntry>,
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry").field("count", &self.entries.len()).finish()
    }
}

impl NativeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard runtime library
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("print", native_print);
        registry.register("channel.new", native_channel_new);
        registry.register("channel.close", native_channel_close);
        registry.register("channel.len", native_channel_len);
        registry.register("channel.is_closed", native_channel_is_closed);
        registry.register("fiber.spawn", native_fiber_spawn);
        registry.register("fiber.unpark", native_fiber_unpark);
        registry.register("fiber.current", native_fiber_current);
        registry.register("time.now_ms", native_time_now_ms);
        registry.register_blocking("thread.sleep", native_thread_sleep);
        registry
    }

    /// Register a non-blocking native
    pub fn register(&mut self, name: impl Into<String>, func: NativeFn) {
        self.entries.insert(name.into(), NativeEntry { func, blocking: false });
    }

    /// Register a thread-blocking native
    pub fn register_blocking(&mut self, name: impl Into<String>, func: NativeFn) {
        self.entries.insert(name.into(), NativeEntry { func, blocking: true });
    }

    /// Look up a native
    pub fn get(&self, name: &str) -> Option<NativeEntry> {
        self.entries.get(name).copied()
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of natives
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn arg<'v>(name: &str, args: &'v [Value], index: usize) -> Result<&'v Value, ExecError> {
    args.get(index).ok_or_else(|| ExecError::Native {
        name: name.to_string(),
        message: format!("missing argument {}", index),
    })
}

fn channel_arg<'v>(name: &str, args: &'v [Value]) -> Result<&'v Channel<Value>, ExecError> {
    let value = arg(name, args, 0)?;
    value.as_channel().ok_or_else(|| ExecError::type_error("channel", value))
}

fn int_arg(name: &str, args: &[Value], index: usize) -> Result<i64, ExecError> {
    let value = arg(name, args, index)?;
    value.as_int().ok_or_else(|| ExecError::type_error("int", value))
}

fn native_print(ctx: &NativeContext<'_>, args: &[Value]) -> Result<Value, ExecError> {
    let line = args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ");
    ctx.engine.print(line);
    Ok(Value::Null)
}

/// `channel.new([capacity[, policy]])`; no or a negative capacity is
/// unbounded, 0 is a transfer channel
fn native_channel_new(_ctx: &NativeContext<'_>, args: &[Value]) -> Result<Value, ExecError> {
    let capacity = match args.first() {
        Some(_) => int_arg("channel.new", args, 0)?,
        None => -1,
    };
    let policy = match args.get(1) {
        None | Some(Value::Null) => OverflowPolicy::Block,
        Some(Value::Str(s)) => match &**s {
            "block" => OverflowPolicy::Block,
            "throw" => OverflowPolicy::Throw,
            "displace" => OverflowPolicy::Displace,
            other => {
                return Err(ExecError::Native {
                    name: "channel.new".to_string(),
                    message: format!("unknown overflow policy `{}`", other),
                })
            }
        },
        Some(other) => return Err(ExecError::type_error("string", other)),
    };
    let config = if capacity < 0 {
        ChannelConfig::unbounded()
    } else {
        ChannelConfig::bounded(capacity as usize)
    }
    .overflow(policy)
    .single_consumer(false);
    let config = if policy == OverflowPolicy::Displace {
        config.single_consumer(true)
    } else {
        config
    };
    let channel = Channel::new(config).map_err(|e| ExecError::Native {
        name: "channel.new".to_string(),
        message: e.to_string(),
    })?;
    Ok(Value::Channel(channel))
}

fn native_channel_close(_ctx: &NativeContext<'_>, args: &[Value]) -> Result<Value, ExecError> {
    channel_arg("channel.close", args)?.close();
    Ok(Value::Null)
}

fn native_channel_len(_ctx: &NativeContext<'_>, args: &[Value]) -> Result<Value, ExecError> {
    Ok(Value::Int(channel_arg("channel.len", args)?.len() as i64))
}

fn native_channel_is_closed(_ctx: &NativeContext<'_>, args: &[Value]) -> Result<Value, ExecError> {
    Ok(Value::Bool(channel_arg("channel.is_closed", args)?.is_closed()))
}

/// `fiber.spawn(method, args...)`
fn native_fiber_spawn(ctx: &NativeContext<'_>, args: &[Value]) -> Result<Value, ExecError> {
    let target = arg("fiber.spawn", args, 0)?;
    let entry = match target {
        Value::Method(name) | Value::Str(name) => name.to_string(),
        other => return Err(ExecError::type_error("method", other)),
    };
    let fiber = ctx.engine.spawn(&entry, args[1..].to_vec())?;
    Ok(Value::Fiber(fiber))
}

fn native_fiber_unpark(_ctx: &NativeContext<'_>, args: &[Value]) -> Result<Value, ExecError> {
    let value = arg("fiber.unpark", args, 0)?;
    let fiber = value.as_fiber().ok_or_else(|| ExecError::type_error("fiber", value))?;
    fiber.unpark();
    Ok(Value::Null)
}

fn native_fiber_current(_ctx: &NativeContext<'_>, _args: &[Value]) -> Result<Value, ExecError> {
    Ok(Fiber::current().map(Value::Fiber).unwrap_or_default())
}

fn native_time_now_ms(_ctx: &NativeContext<'_>, _args: &[Value]) -> Result<Value, ExecError> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(Value::Int(now.as_millis() as i64))
}

fn native_thread_sleep(_ctx: &NativeContext<'_>, args: &[Value]) -> Result<Value, ExecError> {
    let ms = int_arg("thread.sleep", args, 0)?;
    std::thread::sleep(Duration::from_millis(ms.max(0) as u64));
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Program;
    use crate::verify::Verifier;

    fn engine() -> Arc<Engine> {
        Engine::new(Program::new(), NativeRegistry::with_defaults(), Verifier::default())
    }

    fn call(engine: &Arc<Engine>, name: &str, args: &[Value]) -> Result<Value, ExecError> {
        let entry = engine.natives().get(name).unwrap();
        (entry.func)(&NativeContext { engine }, args)
    }

    #[test]
    fn test_defaults_registered() {
        let registry = NativeRegistry::with_defaults();
        assert!(registry.contains("print"));
        assert!(registry.get("thread.sleep").unwrap().blocking);
        assert!(!registry.get("channel.new").unwrap().blocking);
    }

    #[test]
    fn test_channel_natives() {
        let engine = engine();
        let ch = call(&engine, "channel.new", &[Value::Int(2), "throw".into()]).unwrap();
        let channel = ch.as_channel().unwrap().clone();
        assert_eq!(channel.capacity(), Some(2));
        channel.try_send(Value::Int(1)).unwrap();
        assert_eq!(call(&engine, "channel.len", &[ch.clone()]).unwrap(), Value::Int(1));
        call(&engine, "channel.close", &[ch.clone()]).unwrap();
        assert_eq!(call(&engine, "channel.is_closed", &[ch]).unwrap(), Value::Bool(true));

        let unbounded = call(&engine, "channel.new", &[]).unwrap();
        assert_eq!(unbounded.as_channel().unwrap().capacity(), None);
        let negative = call(&engine, "channel.new", &[Value::Int(-1)]).unwrap();
        assert_eq!(negative.as_channel().unwrap().capacity(), None);
        let transfer = call(&engine, "channel.new", &[Value::Int(0)]).unwrap();
        assert!(transfer.as_channel().unwrap().is_transfer());
        assert!(call(&engine, "channel.new", &[Value::Int(0), "displace".into()]).is_err());
        assert!(call(&engine, "channel.new", &[Value::Int(1), "drop".into()]).is_err());
    }

    #[test]
    fn test_print_is_captured() {
        let engine = engine();
        engine.capture_output();
        call(&engine, "print", &[Value::Int(1), "two".into()]).unwrap();
        assert_eq!(engine.take_output(), vec!["1 two".to_string()]);
    }

    #[test]
    fn test_spawn_without_scheduler_fails() {
        let engine = engine();
        let err = call(&engine, "fiber.spawn", &[Value::Method("A.f".into())]).unwrap_err();
        assert!(matches!(err, ExecError::Native { .. } | ExecError::UnknownMethod(_)));
    }

    #[test]
    fn test_type_errors() {
        let engine = engine();
        assert!(matches!(
            call(&engine, "channel.len", &[Value::Int(3)]),
            Err(ExecError::Type(_))
        ));
        assert!(matches!(call(&engine, "thread.sleep", &[]), Err(ExecError::Native { .. })));
    }
}
