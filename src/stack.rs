//! The branching parse stack: versions, links, merging, and pops.
//!
//! Multiple versions of the stack exist simultaneously, representing
//! different parse paths. Each version is a leaf of a DAG whose nodes carry
//! parse states and whose links carry trees; versions that reach the same
//! state at the same position can be merged, so shared history is stored
//! once and re-enumerated only when popped.

use std::io;

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::error_costs::{ERROR_COST_PER_RECOVERY, ERROR_STATE};
use crate::length::Length;
use crate::tree::Tree;
use crate::StateId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of links out of a single node. Fan-in past this bound is
/// dropped by priority during merge. Eight is a common bound for GLR.
pub const MAX_LINK_COUNT: usize = 8;

/// Cap on concurrently explored paths during iteration.
const MAX_ITERATOR_COUNT: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Index of one leaf (head) of the stack. Dense, starting at zero; stable
/// until a pop or merge renumbers the table.
pub type StackVersion = usize;

/// Index of a node in the stack's pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NodeId(u32);

#[derive(Clone)]
struct StackLink<T> {
    node: NodeId,
    tree: Option<T>,
    pending: bool,
}

struct StackNode<T> {
    state: StateId,
    position: Length,
    error_cost: u32,
    ref_count: u32,
    links: Vec<StackLink<T>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StackStatus {
    Active,
    Paused,
    Halted,
}

struct StackHead<T> {
    node: NodeId,
    status: StackStatus,
    last_external_token: Option<T>,
    lookahead_when_paused: Option<T>,
    summary: Option<StackSummary>,
}

/// One path revealed by a pop: the trees along it in push order, and the
/// version whose head is the path's terminus. Slices whose paths end at the
/// same node share a version.
#[derive(Debug)]
pub struct StackSlice<T> {
    pub version: StackVersion,
    pub trees: Vec<T>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopStatus {
    Succeeded,
    /// A path ran into the error state before reaching its goal; the slices
    /// collected up to that point are still returned.
    StoppedAtError,
    /// Reserved for allocation failure.
    Failed,
}

#[derive(Debug)]
pub struct PopResult<T> {
    pub status: PopStatus,
    pub slices: Vec<StackSlice<T>>,
}

/// Verdict returned by an [`iterate`](Stack::iterate) visitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackAction {
    /// Keep exploring this path's predecessors.
    None,
    /// Emit the current prefix as a slice and stop exploring this path.
    Pop,
    /// Abort the entire iteration.
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackSummaryEntry {
    pub position: Length,
    pub depth: u32,
    pub state: StateId,
}

pub type StackSummary = Vec<StackSummaryEntry>;

/// Internal verdict of an engine callback. Unlike the public
/// [`StackAction`], it distinguishes abandoning a single path from aborting
/// the whole walk.
#[derive(Clone, Copy, PartialEq, Eq)]
enum IterAction {
    Continue,
    /// Emit the current prefix and stop exploring this path.
    Emit,
    /// Abandon this path without emitting.
    StopPath,
    /// Abort the entire walk.
    Abort,
}

/// One in-flight path of a backward walk. Trees accumulate in walk order
/// (head toward root) and are reversed into push order when emitted.
#[derive(Clone)]
struct StackIterator<T> {
    node: NodeId,
    trees: Vec<T>,
    tree_count: u32,
    is_pending: bool,
}

// ---------------------------------------------------------------------------
// Node pool
// ---------------------------------------------------------------------------

/// Slot-reuse pool for stack nodes. Released nodes keep their slot and go on
/// a free list, so node ids stay stable for the life of the stack.
struct NodePool<T> {
    slots: Vec<StackNode<T>>,
    free: Vec<NodeId>,
}

impl<T: Tree> NodePool<T> {
    fn new() -> Self {
        NodePool {
            slots: Vec::with_capacity(32),
            free: Vec::new(),
        }
    }

    #[inline]
    fn get(&self, id: NodeId) -> &StackNode<T> {
        &self.slots[id.0 as usize]
    }

    #[inline]
    fn get_mut(&mut self, id: NodeId) -> &mut StackNode<T> {
        &mut self.slots[id.0 as usize]
    }

    fn alloc(&mut self, node: StackNode<T>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0 as usize] = node;
                id
            }
            None => {
                self.slots.push(node);
                NodeId(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Create a node on top of `previous`, absorbing the caller's reference
    /// to it into the new link. A `None` tree leaves the position unchanged.
    fn new_node(
        &mut self,
        previous: Option<NodeId>,
        tree: Option<T>,
        pending: bool,
        state: StateId,
    ) -> NodeId {
        let (position, error_cost, links) = match previous {
            Some(prev_id) => {
                let prev = self.get(prev_id);
                let mut position = prev.position;
                if let Some(tree) = &tree {
                    position += tree.total_size();
                }
                let link = StackLink {
                    node: prev_id,
                    tree,
                    pending,
                };
                (position, prev.error_cost, vec![link])
            }
            None => (Length::ZERO, 0, Vec::new()),
        };
        self.alloc(StackNode {
            state,
            position,
            error_cost,
            ref_count: 1,
            links,
        })
    }

    fn retain(&mut self, id: NodeId) {
        let node = self.get_mut(id);
        debug_assert!(node.ref_count > 0);
        node.ref_count += 1;
    }

    /// Decrement a node's ref count, freeing it and cascading to its
    /// predecessors when it reaches zero. The walk iterates along the first
    /// predecessor so recursion depth is bounded by fan-out, not stack depth.
    fn release(&mut self, mut id: NodeId) {
        loop {
            let node = self.get_mut(id);
            debug_assert!(node.ref_count > 0);
            node.ref_count -= 1;
            if node.ref_count > 0 {
                return;
            }

            let links = std::mem::take(&mut node.links);
            self.free.push(id);

            let mut first_predecessor = None;
            for (i, link) in links.into_iter().enumerate() {
                if i == 0 {
                    first_predecessor = Some(link.node);
                } else {
                    self.release(link.node);
                }
                // link.tree handle drops here
            }
            match first_predecessor {
                Some(next) => id = next,
                None => return,
            }
        }
    }

    /// Append a link during merge, deduplicating on `(predecessor, tree
    /// identity, pending)`. When the link list is full, the candidate
    /// competes on error cost with the worst incumbent; incumbents win ties.
    fn add_link(&mut self, id: NodeId, link: StackLink<T>) {
        if link.node == id {
            return;
        }

        let already_present = self.get(id).links.iter().any(|existing| {
            existing.node == link.node
                && existing.pending == link.pending
                && tree_identity_eq(&existing.tree, &link.tree)
        });
        if already_present {
            return;
        }

        if self.get(id).links.len() == MAX_LINK_COUNT {
            let candidate_cost = self.get(link.node).error_cost;
            let mut worst_index = 0;
            let mut worst_cost = 0;
            for (i, existing) in self.get(id).links.iter().enumerate() {
                let cost = self.get(existing.node).error_cost;
                if cost >= worst_cost {
                    worst_index = i;
                    worst_cost = cost;
                }
            }
            if candidate_cost >= worst_cost {
                return;
            }
            self.retain(link.node);
            let evicted = std::mem::replace(&mut self.get_mut(id).links[worst_index], link);
            self.release(evicted.node);
            return;
        }

        self.retain(link.node);
        self.get_mut(id).links.push(link);
    }
}

#[inline]
fn tree_identity_eq<T: Tree>(a: &Option<T>, b: &Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.ptr_eq(b),
        (None, None) => true,
        _ => false,
    }
}

fn advance_iterator<T: Tree>(
    iterator: &mut StackIterator<T>,
    link: &StackLink<T>,
    include_trees: bool,
) {
    iterator.node = link.node;
    match &link.tree {
        Some(tree) => {
            if include_trees {
                iterator.trees.push(tree.clone());
            }
            if !tree.is_extra() {
                iterator.tree_count += 1;
                if !link.pending {
                    iterator.is_pending = false;
                }
            }
        }
        // Tree-less links mark error recoveries; they count as an entry and
        // are never pending.
        None => {
            iterator.tree_count += 1;
            iterator.is_pending = false;
        }
    }
}

fn iterators_equal<T: Tree>(a: &StackIterator<T>, b: &StackIterator<T>) -> bool {
    a.node == b.node
        && a.tree_count == b.tree_count
        && a.is_pending == b.is_pending
        && a.trees.len() == b.trees.len()
        && a.trees.iter().zip(&b.trees).all(|(x, y)| x.ptr_eq(y))
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

pub struct Stack<T: Tree> {
    heads: Vec<StackHead<T>>,
    nodes: NodePool<T>,
    base_node: NodeId,
}

impl<T: Tree> Stack<T> {
    /// Create a stack with one version whose head is a fresh root node in
    /// state `0` at position zero.
    pub fn new() -> Self {
        let mut nodes = NodePool::new();
        let base_node = nodes.new_node(None, None, false, 0);
        let mut stack = Stack {
            heads: Vec::with_capacity(4),
            nodes,
            base_node,
        };
        stack.clear();
        stack
    }

    pub fn version_count(&self) -> usize {
        self.heads.len()
    }

    pub fn halted_version_count(&self) -> usize {
        self.heads
            .iter()
            .filter(|head| head.status == StackStatus::Halted)
            .count()
    }

    /// The parse state at the top of a version.
    pub fn state(&self, version: StackVersion) -> StateId {
        self.nodes.get(self.heads[version].node).state
    }

    /// The accumulated position of a version's head.
    pub fn position(&self, version: StackVersion) -> Length {
        self.nodes.get(self.heads[version].node).position
    }

    /// The error cost of a version, charged one extra recovery while the
    /// head is paused or sitting on a fresh error link.
    pub fn error_cost(&self, version: StackVersion) -> u32 {
        let head = &self.heads[version];
        let node = self.nodes.get(head.node);
        let mut result = node.error_cost;
        let on_fresh_error = node.state == ERROR_STATE
            && node.links.first().is_some_and(|link| link.tree.is_none());
        if head.status == StackStatus::Paused || on_fresh_error {
            result += ERROR_COST_PER_RECOVERY;
        }
        result
    }

    pub fn is_active(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Active
    }

    pub fn is_halted(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Halted
    }

    pub fn is_paused(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Paused
    }

    pub fn last_external_token(&self, version: StackVersion) -> Option<&T> {
        self.heads[version].last_external_token.as_ref()
    }

    pub fn set_last_external_token(&mut self, version: StackVersion, token: Option<T>) {
        self.heads[version].last_external_token = token;
    }

    /// Push a tree onto a version, advancing its head to `state`. The old
    /// head stays alive through the new link; merging is never done eagerly,
    /// so equal heads coexist until [`merge`](Stack::merge).
    pub fn push(&mut self, version: StackVersion, tree: T, pending: bool, state: StateId) {
        trace!(version, state, pending, "push");
        self.push_link(version, Some(tree), pending, state);
    }

    fn push_link(&mut self, version: StackVersion, tree: Option<T>, pending: bool, state: StateId) {
        let head_node = self.heads[version].node;
        let new_node = self.nodes.new_node(Some(head_node), tree, pending, state);
        self.heads[version].node = new_node;
    }

    /// Mark a version as finished; halted heads are skipped by merge and
    /// must not be pushed to.
    pub fn halt_version(&mut self, version: StackVersion) {
        trace!(version, "halt");
        self.heads[version].status = StackStatus::Halted;
    }

    /// Transition a version's head into the error state. The new head is
    /// linked to the old one over a tree-less link at the same position.
    pub fn record_error(&mut self, version: StackVersion) {
        debug!(version, "record_error");
        self.push_link(version, None, false, ERROR_STATE);
    }

    /// Park a version along with the token it could not shift.
    pub fn pause(&mut self, version: StackVersion, lookahead: T) {
        let head = &mut self.heads[version];
        head.status = StackStatus::Paused;
        head.lookahead_when_paused = Some(lookahead);
    }

    /// Reactivate a paused version, returning the stored lookahead.
    pub fn resume(&mut self, version: StackVersion) -> Option<T> {
        let head = &mut self.heads[version];
        debug_assert!(head.status == StackStatus::Paused);
        head.status = StackStatus::Active;
        head.lookahead_when_paused.take()
    }

    /// Drop a head; versions above it shift down by one.
    pub fn remove_version(&mut self, version: StackVersion) {
        let head = self.heads.remove(version);
        self.nodes.release(head.node);
    }

    /// Move version `v1` into slot `v2`, dropping `v2`'s old head. `v2` must
    /// be the lower index; versions above `v1` shift down by one.
    pub fn renumber_version(&mut self, v1: StackVersion, v2: StackVersion) {
        if v1 == v2 {
            return;
        }
        debug_assert!(v2 < v1);
        let mut source = self.heads.remove(v1);
        if source.summary.is_none() {
            source.summary = self.heads[v2].summary.take();
        }
        let target = std::mem::replace(&mut self.heads[v2], source);
        self.nodes.release(target.node);
    }

    pub fn swap_versions(&mut self, v1: StackVersion, v2: StackVersion) {
        self.heads.swap(v1, v2);
    }

    /// Duplicate a version, returning the new index.
    pub fn copy_version(&mut self, version: StackVersion) -> StackVersion {
        let head = &self.heads[version];
        let copy = StackHead {
            node: head.node,
            status: head.status,
            last_external_token: head.last_external_token.clone(),
            lookahead_when_paused: head.lookahead_when_paused.clone(),
            summary: None,
        };
        self.nodes.retain(copy.node);
        self.heads.push(copy);
        self.heads.len() - 1
    }

    /// Unify every pair of active versions whose heads have the same state,
    /// position, and error cost. The lower-indexed head survives and absorbs
    /// the loser's links, deduplicated and bounded by [`MAX_LINK_COUNT`].
    pub fn merge(&mut self) {
        let mut i = 0;
        while i < self.heads.len() {
            let mut j = i + 1;
            while j < self.heads.len() {
                if self.can_merge(i, j) {
                    debug!(survivor = i, absorbed = j, "merge");
                    let survivor_node = self.heads[i].node;
                    let loser_links = self.nodes.get(self.heads[j].node).links.clone();
                    for link in loser_links {
                        self.nodes.add_link(survivor_node, link);
                    }
                    self.remove_version(j);
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
    }

    fn can_merge(&self, v1: StackVersion, v2: StackVersion) -> bool {
        let head1 = &self.heads[v1];
        let head2 = &self.heads[v2];
        let node1 = self.nodes.get(head1.node);
        let node2 = self.nodes.get(head2.node);
        head1.status == StackStatus::Active
            && head2.status == StackStatus::Active
            && node1.state == node2.state
            && node1.position.bytes == node2.position.bytes
            && node1.error_cost == node2.error_cost
            && tree_identity_eq(&head1.last_external_token, &head2.last_external_token)
    }

    /// Pop `count` non-extra trees from a version, producing one slice per
    /// distinct path. Extra trees never count toward the goal but appear in
    /// the slices. A path that runs into the error state below the head
    /// completes early and tags the result [`PopStatus::StoppedAtError`].
    pub fn pop_count(&mut self, version: StackVersion, count: usize) -> PopResult<T> {
        let head_node = self.heads[version].node;
        let goal = count as u32;
        let mut found_error = false;
        let emissions = self.iter_internal(version, true, &mut |node, iterator| {
            if iterator.tree_count == goal {
                return IterAction::Emit;
            }
            if node.state == ERROR_STATE && iterator.node != head_node {
                found_error = true;
                return IterAction::Emit;
            }
            IterAction::Continue
        });
        let status = if found_error {
            PopStatus::StoppedAtError
        } else {
            PopStatus::Succeeded
        };
        let result = self.build_pop_result(version, status, emissions);
        trace!(version, count, slices = result.slices.len(), "pop_count");
        result
    }

    /// Undo a speculative shift: pop the head's pending entry and renumber
    /// the revealed version onto `version`. Only paths that have traversed
    /// nothing but pending links can emit; any path that crosses a
    /// non-pending link is abandoned, so a merged head pops just its
    /// speculative history and a head with no pending entry leaves the
    /// stack untouched.
    pub fn pop_pending(&mut self, version: StackVersion) -> PopResult<T> {
        let emissions = self.iter_internal(version, true, &mut |_node, iterator| {
            if iterator.tree_count == 0 {
                IterAction::Continue
            } else if iterator.is_pending {
                IterAction::Emit
            } else {
                IterAction::StopPath
            }
        });
        let mut result = self.build_pop_result(version, PopStatus::Succeeded, emissions);
        if !result.slices.is_empty() {
            let moved = result.slices[0].version;
            self.renumber_version(moved, version);
            for slice in &mut result.slices {
                if slice.version == moved {
                    slice.version = version;
                } else if slice.version > moved {
                    slice.version -= 1;
                }
            }
        }
        result
    }

    /// Pop every path all the way to the root, emitting one slice per path.
    pub fn pop_all(&mut self, version: StackVersion) -> PopResult<T> {
        let emissions = self.iter_internal(version, true, &mut |node, _iterator| {
            if node.links.is_empty() {
                IterAction::Emit
            } else {
                IterAction::Continue
            }
        });
        self.build_pop_result(version, PopStatus::Succeeded, emissions)
    }

    /// Walk every path from a version's head toward the root, invoking the
    /// visitor at each node with the state, the trees accumulated so far in
    /// push order, the non-extra tree count, and the done/pending flags.
    /// [`StackAction::Pop`] emits the current prefix as a slice, revealing
    /// its terminus as a new version exactly like a pop.
    pub fn iterate<F>(&mut self, version: StackVersion, mut visitor: F) -> PopResult<T>
    where
        F: FnMut(StateId, &[T], usize, bool, bool) -> StackAction,
    {
        let emissions = self.iter_internal(version, true, &mut |node, iterator| {
            let forward: Vec<T> = iterator.trees.iter().rev().cloned().collect();
            let action = visitor(
                node.state,
                &forward,
                iterator.tree_count as usize,
                node.links.is_empty(),
                iterator.is_pending,
            );
            match action {
                StackAction::None => IterAction::Continue,
                StackAction::Pop => IterAction::Emit,
                StackAction::Stop => IterAction::Abort,
            }
        });
        self.build_pop_result(version, PopStatus::Succeeded, emissions)
    }

    /// Record the `(depth, state)` entries reachable within `max_depth`
    /// non-extra trees of a version's head, deduplicated per depth.
    pub fn record_summary(&mut self, version: StackVersion, max_depth: u32) {
        let mut summary: StackSummary = Vec::new();
        self.iter_internal(version, false, &mut |node, iterator| {
            let depth = iterator.tree_count;
            if depth > max_depth {
                return IterAction::StopPath;
            }
            // Extra links leave the depth untouched, so concurrent paths can
            // report depths out of order; the whole summary must be scanned.
            let recorded = summary
                .iter()
                .any(|existing| existing.depth == depth && existing.state == node.state);
            if !recorded {
                summary.push(StackSummaryEntry {
                    position: node.position,
                    depth,
                    state: node.state,
                });
            }
            IterAction::Continue
        });
        self.heads[version].summary = Some(summary);
    }

    pub fn summary(&self, version: StackVersion) -> Option<&StackSummary> {
        self.heads[version].summary.as_ref()
    }

    /// Release every version and reinstall a single head at the root.
    pub fn clear(&mut self) {
        self.nodes.retain(self.base_node);
        while let Some(head) = self.heads.pop() {
            self.nodes.release(head.node);
        }
        self.heads.push(StackHead {
            node: self.base_node,
            status: StackStatus::Active,
            last_external_token: None,
            lookahead_when_paused: None,
            summary: None,
        });
    }

    /// Render the stack as a DOT graph for debugging.
    pub fn print_dot_graph<W: io::Write>(&self, f: &mut W) -> io::Result<()> {
        writeln!(f, "digraph stack {{")?;
        writeln!(f, "rankdir=\"RL\";")?;
        writeln!(f, "edge [arrowhead=none]")?;

        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut queue: Vec<NodeId> = Vec::new();

        for (i, head) in self.heads.iter().enumerate() {
            if head.status == StackStatus::Halted {
                continue;
            }
            writeln!(f, "node_head_{i} [shape=none, label=\"\"]")?;
            write!(f, "node_head_{i} -> node_{} [", head.node.0)?;
            if head.status == StackStatus::Paused {
                write!(f, "color=red ")?;
            }
            writeln!(
                f,
                "label={i}, fontcolor=blue, weight=10000, labeltooltip=\"error_cost: {}\"]",
                self.error_cost(i)
            )?;
            queue.push(head.node);
        }

        while let Some(id) = queue.pop() {
            if !visited.insert(id) {
                continue;
            }
            let node = self.nodes.get(id);

            write!(f, "node_{} [", id.0)?;
            let behind_extra = node.links.len() == 1
                && node.links[0].tree.as_ref().is_some_and(|tree| tree.is_extra());
            if node.state == ERROR_STATE {
                write!(f, "label=\"?\"")?;
            } else if behind_extra {
                write!(f, "shape=point margin=0 label=\"\"")?;
            } else {
                write!(f, "label=\"{}\"", node.state)?;
            }
            writeln!(
                f,
                " tooltip=\"position: {},{}\nerror_cost: {}\"];",
                node.position.extent.row + 1,
                node.position.extent.column,
                node.error_cost
            )?;

            for link in &node.links {
                write!(f, "node_{} -> node_{} [", id.0, link.node.0)?;
                if link.pending {
                    write!(f, "style=dashed ")?;
                }
                match &link.tree {
                    Some(tree) => {
                        if tree.is_extra() {
                            write!(f, "fontcolor=gray ")?;
                        }
                        write!(f, "label=\"{}b\"", tree.size().bytes)?;
                    }
                    None => write!(f, "color=red")?,
                }
                writeln!(f, "];")?;
                queue.push(link.node);
            }
        }

        writeln!(f, "}}")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Iteration engine
    // -----------------------------------------------------------------------

    /// Walk backward from a version's head, breadth-wise round by round. The
    /// first link of a node advances its iterator in place; later links fork
    /// copies inserted right after it in declaration order and explored from
    /// the next round, which keeps emission order depth-balanced and
    /// link-ordered. Returns the `(terminus, trees)` pairs emitted by `Pop`.
    fn iter_internal(
        &mut self,
        version: StackVersion,
        include_trees: bool,
        callback: &mut dyn FnMut(&StackNode<T>, &StackIterator<T>) -> IterAction,
    ) -> Vec<(NodeId, Vec<T>)> {
        let head_node = self.heads[version].node;
        let mut iterators = vec![StackIterator {
            node: head_node,
            trees: Vec::new(),
            tree_count: 0,
            is_pending: true,
        }];
        let mut emissions: Vec<(NodeId, Vec<T>)> = Vec::new();

        'rounds: while !iterators.is_empty() {
            // Coalesce iterators that converged on the same node with the
            // same accumulated trees; the shared tail would otherwise be
            // enumerated once per duplicate.
            let mut i = 0;
            while i < iterators.len() {
                let mut j = i + 1;
                while j < iterators.len() {
                    if iterators_equal(&iterators[i], &iterators[j]) {
                        iterators.remove(j);
                    } else {
                        j += 1;
                    }
                }
                i += 1;
            }

            let mut i = 0;
            let mut end = iterators.len();
            while i < end {
                let node_id = iterators[i].node;
                let node = self.nodes.get(node_id);

                match callback(node, &iterators[i]) {
                    IterAction::Emit => {
                        let mut iterator = iterators.remove(i);
                        iterator.trees.reverse();
                        emissions.push((node_id, iterator.trees));
                        end -= 1;
                        continue;
                    }
                    IterAction::StopPath => {
                        iterators.remove(i);
                        end -= 1;
                        continue;
                    }
                    IterAction::Abort => break 'rounds,
                    IterAction::Continue => {}
                }

                if node.links.is_empty() {
                    iterators.remove(i);
                    end -= 1;
                    continue;
                }

                let mut forked = 0;
                for link in node.links.iter().skip(1) {
                    if iterators.len() >= MAX_ITERATOR_COUNT {
                        break;
                    }
                    let mut fork = iterators[i].clone();
                    advance_iterator(&mut fork, link, include_trees);
                    iterators.insert(i + 1 + forked, fork);
                    forked += 1;
                }
                advance_iterator(&mut iterators[i], &node.links[0], include_trees);
                i += 1 + forked;
                end += forked;
            }
        }

        emissions
    }

    /// Turn emitted paths into slices, creating one new version per distinct
    /// terminus in emission order. Slices whose paths end at the same node
    /// are grouped together and share that version.
    fn build_pop_result(
        &mut self,
        original_version: StackVersion,
        status: PopStatus,
        emissions: Vec<(NodeId, Vec<T>)>,
    ) -> PopResult<T> {
        let mut slices: Vec<StackSlice<T>> = Vec::with_capacity(emissions.len());
        for (node, trees) in emissions {
            let existing = slices
                .iter()
                .rposition(|slice| self.heads[slice.version].node == node);
            match existing {
                Some(pos) => {
                    let version = slices[pos].version;
                    slices.insert(pos + 1, StackSlice { version, trees });
                }
                None => {
                    let version = self.add_version_from(original_version, node);
                    slices.push(StackSlice { version, trees });
                }
            }
        }
        PopResult { status, slices }
    }

    fn add_version_from(&mut self, original: StackVersion, node: NodeId) -> StackVersion {
        let last_external_token = self.heads[original].last_external_token.clone();
        self.nodes.retain(node);
        self.heads.push(StackHead {
            node,
            status: StackStatus::Active,
            last_external_token,
            lookahead_when_paused: None,
            summary: None,
        });
        self.heads.len() - 1
    }
}

impl<T: Tree> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Tree> Drop for Stack<T> {
    fn drop(&mut self) {
        while let Some(head) = self.heads.pop() {
            self.nodes.release(head.node);
        }
        self.nodes.release(self.base_node);
    }
}
