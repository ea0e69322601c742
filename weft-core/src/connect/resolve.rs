//! Path Resolver
//!
//! Walks a [`ConnectionSpec`] through the live entity graph and produces the
//! links a node should hold: `Source` links to the properties it reads and
//! `Reconnect` links to every intermediate property the path went through.
//!
//! Resolution never raises. A failure is reported as a message and leaves
//! only the reconnect links in place, so the path is retried as soon as one
//! of the intermediate properties changes.

use smallvec::SmallVec;

use super::spec::{ConnectionSpec, Segment};
use crate::error::Result;
use crate::graph::{Link, NodeId};
use crate::value::{EntityId, Value};

/// Where the first segment of a path is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Names registered on the engine with `expose`.
    Root,
    /// Members of an entity.
    Entity(EntityId),
}

/// What a name refers to within a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    /// A property node.
    Node(NodeId),
    /// A static value.
    Attribute(Value),
}

/// Capability the resolver needs from its environment.
pub trait PathContext {
    /// Look up `name` in `scope`.
    fn member(&self, scope: Scope, name: &str) -> Option<Member>;

    /// Read the current value of a node, computing it if needed.
    fn read(&self, node: NodeId) -> Result<Value>;
}

/// The outcome of resolving one spec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub links: SmallVec<[Link; 4]>,
    pub failure: Option<String>,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        self.failure.is_none()
    }
}

/// Resolve `spec` starting at `root`.
pub fn resolve(ctx: &dyn PathContext, root: Scope, spec: &ConnectionSpec) -> Resolution {
    let mut resolution = Resolution::default();
    let mut walker = Walker {
        ctx,
        links: &mut resolution.links,
    };

    if let Err(failure) = walker.walk(root, spec.path(), String::new()) {
        resolution.links.retain(|l| l.role == crate::graph::LinkRole::Reconnect);
        resolution.failure = Some(failure);
    }
    resolution
}

struct Walker<'a> {
    ctx: &'a dyn PathContext,
    links: &'a mut SmallVec<[Link; 4]>,
}

impl Walker<'_> {
    fn walk(&mut self, scope: Scope, segments: &[Segment], mut path: String) -> std::result::Result<(), String> {
        let Some((Segment::Name(name), rest)) = segments.split_first() else {
            return Ok(());
        };
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(name);

        let member = self
            .ctx
            .member(scope, name)
            .ok_or_else(|| format!("{path} does not exist."))?;

        if rest.is_empty() {
            return match member {
                Member::Node(id) => {
                    self.links.push(Link::source(id));
                    Ok(())
                }
                Member::Attribute(_) => Err(format!("{path} is not a signal.")),
            };
        }

        let value = match member {
            Member::Node(id) => {
                self.links.push(Link::reconnect(id));
                self.ctx
                    .read(id)
                    // An intermediate that cannot be read yields no object.
                    .map_err(|_| format!("{path} does not exist."))?
            }
            Member::Attribute(value) => value,
        };

        match rest.split_first() {
            Some((Segment::Wildcard, rest)) => {
                path.push('*');
                let items = value
                    .as_list()
                    .ok_or_else(|| format!("{path} is not a list."))?;
                for item in items {
                    match item {
                        Value::Entity(id) => self.walk(Scope::Entity(*id), rest, path.clone())?,
                        Value::Null => {}
                        _ => return Err(format!("{path} does not only contain entities.")),
                    }
                }
                Ok(())
            }
            _ => match value {
                Value::Entity(id) => self.walk(Scope::Entity(id), rest, path),
                _ => {
                    let next = match rest.first() {
                        Some(Segment::Name(next)) => format!("{path}.{next}"),
                        _ => path,
                    };
                    Err(format!("{next} does not exist."))
                }
            },
        }
    }
}
