//! Default handler: a nested tree of methods, constructors, and sources.
//!
//! The tree is the statically-typed rendition of "walk an object by path":
//! an explicit recursive variant resolved segment by segment, with the
//! prototype-bridging segment names rejected outright. Methods receive an
//! explicit [`MethodCx`] instead of a bound `this`.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use fxhash::FxHashMap;
use serde::Serialize;

use crate::error::Error;
use crate::source::{Handler, Outcome, Source};
use crate::source_channel::SourceChannel;
use crate::wire::{display_path, Path, Value};

/// Segment names that could bridge into prototype internals in the dynamic
/// original; rejected on every lookup for wire-compatibility.
const FORBIDDEN_SEGMENTS: [&str; 3] = ["__proto__", "prototype", "constructor"];

fn is_forbidden(segment: &str) -> bool {
    FORBIDDEN_SEGMENTS.contains(&segment)
}

/// Call context handed to methods and constructors: the channel the request
/// arrived on and, through it, the link context.
pub struct MethodCx {
    /// The current source channel (for channel creation, the parent).
    pub channel: SourceChannel,
}

impl MethodCx {
    /// The link context attached at channel initialization.
    pub fn context(&self) -> Value {
        self.channel.context()
    }
}

/// A callable leaf of the handler tree.
pub trait Method: Send + Sync {
    fn invoke(&self, cx: MethodCx, args: Vec<Value>) -> BoxFuture<'static, Result<Value, Error>>;
}

/// A constructor leaf: builds a fresh [`Source`] for a new channel.
pub trait Construct: Send + Sync {
    fn construct(
        &self,
        cx: MethodCx,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Source, Error>>;
}

struct FnMethod<F>(F);

impl<F, Fut, R> Method for FnMethod<F>
where
    F: Fn(MethodCx, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
    R: Serialize,
{
    fn invoke(&self, cx: MethodCx, args: Vec<Value>) -> BoxFuture<'static, Result<Value, Error>> {
        let fut = (self.0)(cx, args);
        Box::pin(async move {
            let result = fut.await?;
            // An unencodable result is reported as a parse error, so the
            // caller still gets a response.
            serde_json::to_value(result).map_err(|_| Error::parse_error())
        })
    }
}

struct FnConstruct<F>(F);

impl<F, Fut> Construct for FnConstruct<F>
where
    F: Fn(MethodCx, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Source, Error>> + Send + 'static,
{
    fn construct(
        &self,
        cx: MethodCx,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Source, Error>> {
        Box::pin((self.0)(cx, args))
    }
}

type SourceFuture = Arc<dyn Fn() -> BoxFuture<'static, Result<Source, Error>> + Send + Sync>;

/// One node of the handler tree.
#[derive(Clone)]
enum Node {
    Record(FxHashMap<String, Node>),
    Method(Arc<dyn Method>),
    Constructor {
        construct: Arc<dyn Construct>,
        auto_dispose: bool,
    },
    Source(Source),
    SourceFuture(SourceFuture),
}

/// Fluent builder for the default handler.
///
/// ```
/// # use statewire::{HandlerTree, Error};
/// # use serde_json::json;
/// let source = HandlerTree::new()
///     .method("sum", |_cx, args| async move {
///         let x = args[0].as_i64().unwrap_or(0);
///         let y = args[1].as_i64().unwrap_or(0);
///         Ok(x + y)
///     })
///     .into_source(json!(null))?;
/// # Ok::<(), Error>(())
/// ```
#[derive(Default)]
pub struct HandlerTree {
    nodes: FxHashMap<String, Node>,
    prefix: Option<String>,
}

impl HandlerTree {
    pub fn new() -> Self {
        HandlerTree::default()
    }

    /// Concatenate `prefix` with the first path segment before lookup.
    /// Registered names must then carry the prefix; callers do not send it.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    /// Register a method. The closure result is encoded for the wire.
    pub fn method<F, Fut, R>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(MethodCx, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
        R: Serialize,
    {
        self.nodes
            .insert(name.into(), Node::Method(Arc::new(FnMethod(method))));
        self
    }

    /// Register a constructor for nested channels. Channels created through
    /// it dispose their source on close (the disposable-instance
    /// semantics); use [`constructor_with`](Self::constructor_with) to opt
    /// out.
    pub fn constructor<F, Fut>(self, name: impl Into<String>, construct: F) -> Self
    where
        F: Fn(MethodCx, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Source, Error>> + Send + 'static,
    {
        self.constructor_with(name, true, construct)
    }

    /// Register a constructor with an explicit auto-dispose choice.
    pub fn constructor_with<F, Fut>(
        mut self,
        name: impl Into<String>,
        auto_dispose: bool,
        construct: F,
    ) -> Self
    where
        F: Fn(MethodCx, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Source, Error>> + Send + 'static,
    {
        self.nodes.insert(
            name.into(),
            Node::Constructor {
                construct: Arc::new(FnConstruct(construct)),
                auto_dispose,
            },
        );
        self
    }

    /// Register an existing source for zero-argument channel creation.
    pub fn source(mut self, name: impl Into<String>, source: Source) -> Self {
        self.nodes.insert(name.into(), Node::Source(source));
        self
    }

    /// Register a lazily-resolved source for zero-argument channel creation.
    pub fn source_future<F, Fut>(mut self, name: impl Into<String>, resolve: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Source, Error>> + Send + 'static,
    {
        self.nodes.insert(
            name.into(),
            Node::SourceFuture(Arc::new(move || Box::pin(resolve()))),
        );
        self
    }

    /// Mount another tree under `name`. The nested tree's prefix (if any) is
    /// ignored; prefixes apply to the first segment only.
    pub fn nested(mut self, name: impl Into<String>, tree: HandlerTree) -> Self {
        self.nodes.insert(name.into(), Node::Record(tree.nodes));
        self
    }

    /// Validate the tree and produce the handler.
    pub fn build(self) -> Result<DefaultHandler, Error> {
        if let Some(prefix) = &self.prefix {
            if FORBIDDEN_SEGMENTS
                .iter()
                .any(|forbidden| forbidden.starts_with(prefix.as_str()))
            {
                return Err(Error::wrong_path(format!("forbidden prefix '{prefix}'")));
            }
        }
        validate_keys(&self.nodes)?;
        Ok(DefaultHandler {
            nodes: self.nodes,
            prefix: self.prefix,
        })
    }

    /// Build the handler and wrap it in a [`Source`] with `initial_state`.
    pub fn into_source(self, initial_state: Value) -> Result<Source, Error> {
        Ok(Source::new(self.build()?, initial_state))
    }
}

fn validate_keys(nodes: &FxHashMap<String, Node>) -> Result<(), Error> {
    for (key, node) in nodes {
        if is_forbidden(key) {
            return Err(Error::wrong_path(format!("forbidden step '{key}'")));
        }
        if let Node::Record(nested) = node {
            validate_keys(nested)?;
        }
    }
    Ok(())
}

/// The handler produced by [`HandlerTree::build`].
pub struct DefaultHandler {
    nodes: FxHashMap<String, Node>,
    prefix: Option<String>,
}

impl std::fmt::Debug for DefaultHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultHandler")
            .field("prefix", &self.prefix)
            .field("keys", &self.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DefaultHandler {
    fn resolve(&self, path: &[crate::wire::Segment]) -> Result<Node, Error> {
        if path.is_empty() {
            return Err(Error::wrong_path("empty path"));
        }
        let mut current = &self.nodes;
        for (index, segment) in path.iter().enumerate() {
            let raw = segment.as_text();
            let key = match (&self.prefix, index) {
                (Some(prefix), 0) => format!("{prefix}{raw}"),
                _ => raw.clone(),
            };
            if is_forbidden(&raw) || is_forbidden(&key) {
                return Err(Error::wrong_path(format!("forbidden step '{raw}'")));
            }
            let node = current
                .get(&key)
                .ok_or_else(|| Error::wrong_path(format!("forbidden prop '{key}'")))?;
            if index + 1 == path.len() {
                return Ok(node.clone());
            }
            match node {
                Node::Record(nested) => current = nested,
                _ => return Err(Error::wrong_path(format!("not object at '{key}'"))),
            }
        }
        Err(Error::wrong_path("empty path"))
    }
}

impl Handler for DefaultHandler {
    fn call(
        &self,
        channel: SourceChannel,
        path: Path,
        args: Vec<Value>,
        new_channel: bool,
    ) -> BoxFuture<'static, Result<Outcome, Error>> {
        let resolved = self.resolve(&path);
        Box::pin(async move {
            match resolved? {
                Node::Method(method) => {
                    let value = method.invoke(MethodCx { channel }, args).await?;
                    Ok(Outcome::Value(value))
                }
                Node::Constructor {
                    construct,
                    auto_dispose,
                } => {
                    if !new_channel {
                        return Err(Error::wrong_data_type());
                    }
                    let source = construct.construct(MethodCx { channel }, args).await?;
                    Ok(Outcome::Source {
                        source,
                        auto_dispose,
                    })
                }
                Node::Source(source) => {
                    if !new_channel || !args.is_empty() {
                        return Err(Error::wrong_data_type());
                    }
                    Ok(Outcome::Source {
                        source,
                        auto_dispose: false,
                    })
                }
                Node::SourceFuture(resolve) => {
                    if !new_channel || !args.is_empty() {
                        return Err(Error::wrong_data_type());
                    }
                    let source = resolve().await?;
                    Ok(Outcome::Source {
                        source,
                        auto_dispose: false,
                    })
                }
                Node::Record(_) => Err(Error::wrong_path(format!(
                    "not a function at '{}'",
                    display_path(&path)
                ))),
            }
        })
    }
}
