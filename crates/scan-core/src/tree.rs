//! Command tree: the ordered, mutable forest of commands that editors build
//! and the executor runs.
//!
//! Every command in a tree is reachable by a [`CommandAddress`], the path of
//! child indices from the root. Addresses are what the mutation API resolves,
//! what the executor reports progress against, and what per-run state (loop
//! direction toggles) is keyed by. They are positional: removing or inserting
//! a command shifts the addresses of everything after it.
//!
//! A tree is exclusively owned by its editor while idle. For the duration of
//! a run, ownership transfers to the executor: the executor sets the lock
//! flag and every structural edit fails with `TreeLocked` until the run ends.

use serde::{Deserialize, Serialize};

use crate::command::ScanCommand;
use crate::error::{ScanError, ScanResult};

/// Path of child indices identifying one command within a tree.
///
/// `[2]` is the third top-level command; `[2, 0]` is the first command in
/// its body. Displayed dotted: `2.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandAddress(Vec<usize>);

impl CommandAddress {
    /// Address of a top-level command.
    pub fn top(index: usize) -> Self {
        Self(vec![index])
    }

    /// Address of the `index`-th child of this command.
    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    /// Address of the enclosing command, if this is not top-level.
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() > 1 {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        } else {
            None
        }
    }

    /// The raw index path.
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Nesting depth; top-level commands have depth 1.
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for CommandAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for idx in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{idx}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<Vec<usize>> for CommandAddress {
    fn from(path: Vec<usize>) -> Self {
        Self(path)
    }
}

/// Ordered sequence of top-level commands with nested loop bodies.
///
/// Trees are exchanged through `codec`, never serialized directly — decode
/// always passes through validation.
#[derive(Debug, Default)]
pub struct ScanTree {
    commands: Vec<ScanCommand>,
    /// Executor-ownership flag. Run state, never part of the exchange form.
    locked: bool,
}

impl Clone for ScanTree {
    fn clone(&self) -> Self {
        // A copy is a new tree, not owned by any executor.
        Self {
            commands: self.commands.clone(),
            locked: false,
        }
    }
}

impl PartialEq for ScanTree {
    fn eq(&self, other: &Self) -> bool {
        self.commands == other.commands
    }
}

impl ScanTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tree from a command sequence, validating every command.
    pub fn from_commands(commands: Vec<ScanCommand>) -> ScanResult<Self> {
        for command in &commands {
            command.validate()?;
        }
        Ok(Self {
            commands,
            locked: false,
        })
    }

    /// The ordered top-level command sequence.
    pub fn commands(&self) -> &[ScanCommand] {
        &self.commands
    }

    /// Total number of commands, nested bodies included.
    pub fn len(&self) -> usize {
        self.commands.iter().map(ScanCommand::subtree_len).sum()
    }

    /// Whether the tree holds no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Check every command for well-formedness.
    pub fn validate(&self) -> ScanResult<()> {
        for command in &self.commands {
            command.validate()?;
        }
        Ok(())
    }

    /// Resolve an address to its command.
    pub fn get(&self, address: &CommandAddress) -> Option<&ScanCommand> {
        let (first, rest) = address.indices().split_first()?;
        let mut current = self.commands.get(*first)?;
        for idx in rest {
            current = current.body()?.get(*idx)?;
        }
        Some(current)
    }

    /// Insert a command at `index` within the body of `parent`
    /// (top level when `parent` is `None`).
    ///
    /// Fails with `InvalidPosition` when the index is out of bounds or the
    /// parent cannot hold children, `NotFound` when the parent address does
    /// not resolve, and `MalformedLoop` when the inserted subtree contains a
    /// zero-step loop.
    pub fn insert(
        &mut self,
        parent: Option<&CommandAddress>,
        index: usize,
        command: ScanCommand,
    ) -> ScanResult<()> {
        self.ensure_unlocked()?;
        command.validate()?;
        let body = self.body_of(parent)?;
        if index > body.len() {
            return Err(ScanError::InvalidPosition {
                detail: format!("index {index} not valid for body of length {}", body.len()),
            });
        }
        body.insert(index, command);
        Ok(())
    }

    /// Append a command to the top level.
    pub fn push(&mut self, command: ScanCommand) -> ScanResult<()> {
        let index = self.commands.len();
        self.insert(None, index, command)
    }

    /// Remove and return the command at `address`.
    pub fn remove(&mut self, address: &CommandAddress) -> ScanResult<ScanCommand> {
        self.ensure_unlocked()?;
        let (body, index) = self.containing_body(address)?;
        if index >= body.len() {
            return Err(ScanError::NotFound {
                address: address.to_string(),
            });
        }
        Ok(body.remove(index))
    }

    /// Replace the command at `address`, returning the previous one.
    pub fn replace(
        &mut self,
        address: &CommandAddress,
        command: ScanCommand,
    ) -> ScanResult<ScanCommand> {
        self.ensure_unlocked()?;
        command.validate()?;
        let (body, index) = self.containing_body(address)?;
        let slot = body.get_mut(index).ok_or_else(|| ScanError::NotFound {
            address: address.to_string(),
        })?;
        Ok(std::mem::replace(slot, command))
    }

    /// Move the command at `from` into the body of `to_parent` at `to_index`.
    ///
    /// The destination is interpreted after the removal, so moving within
    /// one body shifts later indices down by one. On failure the tree is
    /// left unchanged.
    pub fn move_command(
        &mut self,
        from: &CommandAddress,
        to_parent: Option<&CommandAddress>,
        to_index: usize,
    ) -> ScanResult<()> {
        let command = self.remove(from)?;
        let destination = self.body_of(to_parent).and_then(|body| {
            if to_index > body.len() {
                Err(ScanError::InvalidPosition {
                    detail: format!(
                        "index {to_index} not valid for body of length {}",
                        body.len()
                    ),
                })
            } else {
                Ok(body)
            }
        });
        match destination {
            Ok(body) => {
                body.insert(to_index, command);
                Ok(())
            }
            Err(err) => {
                // Put the command back where it was.
                let source_index = from.indices().last().copied().unwrap_or(0);
                if let Ok(body) = self.body_of(from.parent().as_ref()) {
                    body.insert(source_index.min(body.len()), command);
                }
                Err(err)
            }
        }
    }

    /// Pre-order, depth-first traversal preserving declared child order.
    pub fn walk(&self) -> TreeWalk<'_> {
        let mut stack: Vec<(CommandAddress, &ScanCommand)> = Vec::new();
        for (idx, command) in self.commands.iter().enumerate().rev() {
            stack.push((CommandAddress::top(idx), command));
        }
        TreeWalk { stack }
    }

    /// Whether an executor currently owns this tree.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Transfer ownership to an executor for the duration of a run.
    ///
    /// Called by the engine at run start; not part of the editor surface.
    pub fn lock(&mut self) -> ScanResult<()> {
        if self.locked {
            return Err(ScanError::TreeLocked);
        }
        self.locked = true;
        Ok(())
    }

    /// Return ownership to the editor after a run.
    pub fn unlock(&mut self) {
        self.locked = false;
    }

    fn ensure_unlocked(&self) -> ScanResult<()> {
        if self.locked {
            return Err(ScanError::TreeLocked);
        }
        Ok(())
    }

    /// Mutable body holding the children of `parent`
    /// (the top level when `parent` is `None`).
    fn body_of(&mut self, parent: Option<&CommandAddress>) -> ScanResult<&mut Vec<ScanCommand>> {
        let Some(parent) = parent else {
            return Ok(&mut self.commands);
        };
        let node = self.node_mut(parent).ok_or_else(|| ScanError::NotFound {
            address: parent.to_string(),
        })?;
        let kind = node.kind();
        node.body_mut().ok_or_else(|| ScanError::InvalidPosition {
            detail: format!("command '{kind}' cannot hold children"),
        })
    }

    /// Mutable body that contains the command at `address`, with the
    /// command's index within it.
    fn containing_body(
        &mut self,
        address: &CommandAddress,
    ) -> ScanResult<(&mut Vec<ScanCommand>, usize)> {
        let indices = address.indices();
        let last = *indices.last().ok_or_else(|| ScanError::NotFound {
            address: address.to_string(),
        })?;
        let body = match address.parent() {
            None => &mut self.commands,
            Some(parent) => {
                let node = self.node_mut(&parent).ok_or_else(|| ScanError::NotFound {
                    address: address.to_string(),
                })?;
                node.body_mut().ok_or_else(|| ScanError::NotFound {
                    address: address.to_string(),
                })?
            }
        };
        Ok((body, last))
    }

    fn node_mut(&mut self, address: &CommandAddress) -> Option<&mut ScanCommand> {
        let (first, rest) = address.indices().split_first()?;
        let mut current = self.commands.get_mut(*first)?;
        for idx in rest {
            current = current.body_mut()?.get_mut(*idx)?;
        }
        Some(current)
    }
}

/// Iterator over `(address, command)` pairs in pre-order.
pub struct TreeWalk<'a> {
    stack: Vec<(CommandAddress, &'a ScanCommand)>,
}

impl<'a> Iterator for TreeWalk<'a> {
    type Item = (CommandAddress, &'a ScanCommand);

    fn next(&mut self) -> Option<Self::Item> {
        let (address, command) = self.stack.pop()?;
        if let Some(body) = command.body() {
            for (idx, child) in body.iter().enumerate().rev() {
                self.stack.push((address.child(idx), child));
            }
        }
        Some((address, command))
    }
}
