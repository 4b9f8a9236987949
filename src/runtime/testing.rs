//! Test support: a tiny expression interpreter and bridge fixtures.
//!
//! Scripts are `;`-separated expressions over integers, floats and strings
//! with `+ - * /`, parentheses and calls. `fail(msg)` raises, `check()` runs
//! the cooperative signal check, `pause(ms)` blocks the evaluating thread
//! without a foreign call, and any other call resolves to a bound foreign
//! function.

use crate::runtime::bridge::Bridge;
use crate::runtime::config::{BridgeConfig, SchedulingModel};
use crate::runtime::error::ScriptError;
use crate::runtime::event_loop::{EventLoop, LoopHost};
use crate::runtime::handle_table::ForeignHandle;
use crate::runtime::interpreter::{CallContext, Interpreter};
use crate::runtime::ops::{Finalizer, ForeignCallable, ForeignInvocation};
use crate::runtime::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub(crate) const MODELS: [SchedulingModel; 2] =
    [SchedulingModel::Threaded, SchedulingModel::Cooperative];

#[derive(Default)]
pub(crate) struct MiniScript {
    bindings: Mutex<HashMap<String, ForeignHandle>>,
    finalizers: Mutex<HashMap<ForeignHandle, Finalizer>>,
    halt: AtomicBool,
    eval_threads: Mutex<Vec<Option<String>>>,
}

impl MiniScript {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the collector destroying the action bound to `name`.
    pub(crate) fn collect(&self, name: &str) -> bool {
        let Some(handle) = self.bindings.lock().remove(name) else {
            return false;
        };
        let finalizer = self.finalizers.lock().remove(&handle);
        match finalizer {
            Some(finalizer) => {
                finalizer.run();
                true
            }
            None => false,
        }
    }

    pub(crate) fn request_halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    /// Names of the threads each evaluation ran on.
    pub(crate) fn eval_threads(&self) -> Vec<Option<String>> {
        self.eval_threads.lock().clone()
    }
}

impl Interpreter for MiniScript {
    fn evaluate(&self, code: &str, ctx: &mut dyn CallContext) -> Result<Value, ScriptError> {
        self.eval_threads
            .lock()
            .push(thread::current().name().map(str::to_string));
        let tokens = tokenize(code)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            script: self,
        };
        parser.program(ctx)
    }

    fn define_foreign(&self, name: &str, handle: ForeignHandle) {
        self.bindings.lock().insert(name.to_string(), handle);
    }

    fn register_finalizer(&self, handle: ForeignHandle, finalizer: Finalizer) {
        self.finalizers.lock().insert(handle, finalizer);
    }

    fn take_halt_signal(&self) -> bool {
        self.halt.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Sym(char),
}

fn tokenize(code: &str) -> Result<Vec<Token>, ScriptError> {
    let chars: Vec<char> = code.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let token = if text.contains('.') {
                text.parse().map(Token::Float).ok()
            } else {
                text.parse().map(Token::Int).ok()
            };
            tokens.push(token.ok_or_else(|| ScriptError::raised(format!("bad number '{}'", text)))?);
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c == '"' {
            let start = i + 1;
            i = start;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            if i >= chars.len() {
                return Err(ScriptError::raised("unterminated string"));
            }
            tokens.push(Token::Str(chars[start..i].iter().collect()));
            i += 1;
        } else if "+-*/(),;".contains(c) {
            tokens.push(Token::Sym(c));
            i += 1;
        } else {
            return Err(ScriptError::raised(format!("unexpected character '{}'", c)));
        }
    }
    Ok(tokens)
}

struct Parser<'s> {
    tokens: Vec<Token>,
    pos: usize,
    script: &'s MiniScript,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, sym: char) -> bool {
        if self.tokens.get(self.pos) == Some(&Token::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, sym: char) -> Result<(), ScriptError> {
        if self.eat(sym) {
            Ok(())
        } else {
            Err(ScriptError::raised(format!("expected '{}'", sym)))
        }
    }

    fn program(&mut self, ctx: &mut dyn CallContext) -> Result<Value, ScriptError> {
        let mut last = Value::Null;
        while !self.at_end() {
            if self.eat(';') {
                continue;
            }
            last = self.expr(ctx)?;
            if !self.at_end() {
                self.expect(';')?;
            }
        }
        Ok(last)
    }

    fn expr(&mut self, ctx: &mut dyn CallContext) -> Result<Value, ScriptError> {
        let mut left = self.term(ctx)?;
        loop {
            if self.eat('+') {
                let right = self.term(ctx)?;
                left = arith('+', left, right)?;
            } else if self.eat('-') {
                let right = self.term(ctx)?;
                left = arith('-', left, right)?;
            } else {
                return Ok(left);
            }
        }
    }

    fn term(&mut self, ctx: &mut dyn CallContext) -> Result<Value, ScriptError> {
        let mut left = self.unary(ctx)?;
        loop {
            if self.eat('*') {
                let right = self.unary(ctx)?;
                left = arith('*', left, right)?;
            } else if self.eat('/') {
                let right = self.unary(ctx)?;
                left = arith('/', left, right)?;
            } else {
                return Ok(left);
            }
        }
    }

    fn unary(&mut self, ctx: &mut dyn CallContext) -> Result<Value, ScriptError> {
        if self.eat('-') {
            let value = self.unary(ctx)?;
            return arith('-', Value::Int(0), value);
        }
        self.primary(ctx)
    }

    fn primary(&mut self, ctx: &mut dyn CallContext) -> Result<Value, ScriptError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ScriptError::raised("unexpected end of input"))?;
        self.pos += 1;
        match token {
            Token::Int(i) => Ok(Value::Int(i)),
            Token::Float(f) => Ok(Value::Float(f)),
            Token::Str(s) => Ok(Value::String(s)),
            Token::Sym('(') => {
                let value = self.expr(ctx)?;
                self.expect(')')?;
                Ok(value)
            }
            Token::Ident(name) => {
                self.expect('(')?;
                let args = self.args(ctx)?;
                self.call(&name, args, ctx)
            }
            Token::Sym(c) => Err(ScriptError::raised(format!("unexpected '{}'", c))),
        }
    }

    fn args(&mut self, ctx: &mut dyn CallContext) -> Result<Vec<Value>, ScriptError> {
        let mut args = Vec::new();
        if self.eat(')') {
            return Ok(args);
        }
        loop {
            args.push(self.expr(ctx)?);
            if self.eat(',') {
                continue;
            }
            self.expect(')')?;
            return Ok(args);
        }
    }

    fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        ctx: &mut dyn CallContext,
    ) -> Result<Value, ScriptError> {
        match name {
            "fail" => Err(ScriptError::raised(
                args.first().map(ToString::to_string).unwrap_or_default(),
            )),
            "check" => {
                ctx.check_signals()?;
                Ok(Value::Null)
            }
            "pause" => {
                let ms = args.first().and_then(Value::as_int).unwrap_or(0);
                thread::sleep(Duration::from_millis(ms.max(0) as u64));
                Ok(Value::Null)
            }
            _ => {
                let handle = self.script.bindings.lock().get(name).copied();
                match handle {
                    Some(handle) => ctx.call_foreign(handle, args),
                    None => Err(ScriptError::raised(format!("undefined function '{}'", name))),
                }
            }
        }
    }
}

fn arith(op: char, left: Value, right: Value) -> Result<Value, ScriptError> {
    match (op, left, right) {
        ('+', Value::String(a), b) => Ok(Value::String(format!("{}{}", a, b))),
        ('+', a, Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        ('/', Value::Int(_), Value::Int(0)) => Err(ScriptError::raised("division by zero")),
        (op, Value::Int(a), Value::Int(b)) => {
            let result = match op {
                '+' => a.checked_add(b),
                '-' => a.checked_sub(b),
                '*' => a.checked_mul(b),
                _ => a.checked_div(b),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| ScriptError::raised("integer overflow"))
        }
        (op, a, b) => {
            let (Some(x), Some(y)) = (as_float(&a), as_float(&b)) else {
                return Err(ScriptError::raised(format!(
                    "cannot apply '{}' to {} and {}",
                    op,
                    a.type_name(),
                    b.type_name()
                )));
            };
            Ok(Value::Float(match op {
                '+' => x + y,
                '-' => x - y,
                '*' => x * y,
                _ => x / y,
            }))
        }
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// A bridge on an [`EventLoop`] host driven by the test thread.
pub(crate) struct Fixture {
    pub(crate) bridge: Bridge,
    pub(crate) host: Arc<LoopHost>,
    pub(crate) script: Arc<MiniScript>,
}

impl Fixture {
    pub(crate) fn new(model: SchedulingModel) -> Self {
        Self::with_config(
            BridgeConfig::new()
                .with_model(model)
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    pub(crate) fn with_config(config: BridgeConfig) -> Self {
        let host = Arc::new(LoopHost::new(EventLoop::new()));
        let script = MiniScript::new();
        let bridge = Bridge::new(config, script.clone(), host.clone()).unwrap();
        Self {
            bridge,
            host,
            script,
        }
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        self.host.event_loop()
    }

    /// Drive the loop until `count` promises have been retired.
    pub(crate) fn run_until_settled(&self, count: usize) {
        let host = self.host.clone();
        let done = self
            .event_loop()
            .run_until(Duration::from_secs(10), || host.settled_count() >= count);
        assert!(done, "timed out waiting for {} settled promise(s)", count);
    }
}

pub(crate) fn double() -> ForeignCallable {
    ForeignCallable::sync(|args: &[Value]| match args.first() {
        Some(Value::Int(i)) => Ok(Value::Int(i * 2)),
        other => Err(Value::String(format!("double expects an int, got {:?}", other))),
    })
}

/// Async function resolving with its argument after that many milliseconds.
pub(crate) fn sleeper(event_loop: EventLoop) -> ForeignCallable {
    ForeignCallable::asynchronous(move |invocation: ForeignInvocation| {
        let ms = invocation.args().first().and_then(Value::as_int).unwrap_or(0);
        event_loop.post_after(Duration::from_millis(ms.max(0) as u64), move || {
            invocation.resolve(Value::Int(ms)).unwrap();
        });
    })
}

pub(crate) type Stash = Arc<Mutex<Vec<ForeignInvocation>>>;

/// Async function that parks every invocation in `stash` for the test to settle.
pub(crate) fn stashing(stash: Stash) -> ForeignCallable {
    ForeignCallable::asynchronous(move |invocation: ForeignInvocation| {
        stash.lock().push(invocation);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle_table::PromiseId;

    struct NoForeign;

    impl CallContext for NoForeign {
        fn call_foreign(
            &mut self,
            _handle: ForeignHandle,
            _args: Vec<Value>,
        ) -> Result<Value, ScriptError> {
            Err(ScriptError::raised("no foreign calls here"))
        }

        fn check_signals(&mut self) -> Result<(), ScriptError> {
            Ok(())
        }

        fn promise(&self) -> Option<PromiseId> {
            None
        }
    }

    fn eval(code: &str) -> Result<Value, ScriptError> {
        MiniScript::new().evaluate(code, &mut NoForeign)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("2+2"), Ok(Value::Int(4)));
        assert_eq!(eval("2 + 3 * (4 - 1)"), Ok(Value::Int(11)));
        assert_eq!(eval("-3 + 1"), Ok(Value::Int(-2)));
        assert_eq!(eval("1.5 * 2"), Ok(Value::Float(3.0)));
        assert_eq!(eval("\"n=\" + 4"), Ok(Value::from("n=4")));
        assert_eq!(eval("1; 2; 3"), Ok(Value::Int(3)));
    }

    #[test]
    fn test_errors() {
        assert_eq!(eval("fail(\"nope\")").unwrap_err().message, "nope");
        assert!(eval("1 / 0").is_err());
        assert!(eval("missing(1)").is_err());
        assert!(eval("(1 + 2").is_err());
    }
}
