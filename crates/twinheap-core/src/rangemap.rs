//! Ordered map augmented with subtree range aggregates.
//!
//! Each entry carries a `range` value next to its key and payload, and every
//! node caches the smallest and largest range stored anywhere in its subtree.
//! The cached window lets range queries skip whole subtrees: [`range_fit`]
//! walks only branches whose window overlaps the request, and the guided
//! descents [`range_minimize`] and [`range_maximize`] pick one branch per
//! level. The allocator built on top keys nodes by block address and stores
//! the reusable payload size as the range, which turns best-fit searches into
//! logarithmic descents.
//!
//! Balance comes from a red-black scheme. A rotation relinks nodes without
//! moving any entry across the rotated pair, so only the two repositioned
//! nodes recompute their aggregates; everything above keeps its window.
//!
//! Nodes live in a [`SlotArena`] and reference each other by slot index, so
//! the map itself contains no raw pointers.
//!
//! [`range_fit`]: RangeMap::range_fit
//! [`range_minimize`]: RangeMap::range_minimize
//! [`range_maximize`]: RangeMap::range_maximize

use std::cmp::Ordering;

use twinheap_pages::{HeapFault, NIL, SlotArena, SlotIndex, die};

/// Deepest `range_fit` backtrack stack. A balanced tree needs two levels per
/// doubling, so 64 covers far more entries than the slot space can hold.
const FIT_STACK_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Clone, Copy)]
struct Node<K: Copy, V: Copy, R: Copy> {
    parent: SlotIndex,
    left: SlotIndex,
    right: SlotIndex,
    color: Color,
    key: K,
    val: V,
    /// Range value of this entry alone.
    range: R,
    /// Smallest range in this node's subtree, itself included.
    min: R,
    /// Largest range in this node's subtree, itself included.
    max: R,
}

impl<K: Copy, V: Copy, R: Copy> Node<K, V, R> {
    fn fresh(key: K, val: V, range: R, color: Color) -> Self {
        Node {
            parent: NIL,
            left: NIL,
            right: NIL,
            color,
            key,
            val,
            range,
            min: range,
            max: range,
        }
    }
}

/// Key/value pair handed back by lookups and ordered walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry<K: Copy, V: Copy> {
    pub key: K,
    pub val: V,
}

/// Red-black tree keyed by `K`, carrying `V` payloads and `R` range
/// aggregates. All node storage comes from an internal [`SlotArena`].
pub struct RangeMap<K: Copy + Ord, V: Copy, R: Copy + Ord> {
    nodes: SlotArena<Node<K, V, R>>,
    root: SlotIndex,
    len: usize,
}

impl<K: Copy + Ord, V: Copy, R: Copy + Ord> RangeMap<K, V, R> {
    /// Creates an empty map whose node arena grows in `slab_bytes` steps.
    pub fn new(slab_bytes: usize) -> Self {
        RangeMap {
            nodes: SlotArena::new(slab_bytes),
            root: NIL,
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of backing memory reserved for node storage.
    #[must_use]
    pub fn bytes_reserved(&self) -> usize {
        self.nodes.bytes_reserved()
    }

    /// Drops every entry and retracts the node arena to its start. The
    /// arena keeps its reservation, so refilling the map does not touch
    /// the memory provider.
    pub fn clear(&mut self) {
        self.nodes.reset();
        self.root = NIL;
        self.len = 0;
    }

    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        let (idx, way) = self.descend(key);
        idx != NIL && way == Ordering::Equal
    }

    /// Returns the value stored under `key`. The key must be present; a
    /// lookup of an absent key means the caller's bookkeeping has diverged
    /// from the tree and is treated as corruption.
    #[must_use]
    pub fn at(&self, key: K) -> V {
        let (idx, way) = self.descend(key);
        if idx == NIL || way != Ordering::Equal {
            die(HeapFault::MissingTreeKey);
        }
        self.node(idx).val
    }

    /// Returns the range stored under `key`, with the same presence
    /// contract as [`at`](Self::at).
    #[must_use]
    pub fn range_at(&self, key: K) -> R {
        let (idx, way) = self.descend(key);
        if idx == NIL || way != Ordering::Equal {
            die(HeapFault::MissingTreeKey);
        }
        self.node(idx).range
    }

    /// Inserts `key` or overwrites it in place. Overwriting refreshes the
    /// aggregate path since the entry's range may have changed.
    pub fn put(&mut self, key: K, val: V, range: R) {
        if self.root == NIL {
            self.root = self
                .nodes
                .allocate_slot(Node::fresh(key, val, range, Color::Black));
            self.len += 1;
            return;
        }

        let (base, way) = self.descend(key);
        if way == Ordering::Equal {
            let node = self.node_mut(base);
            node.val = val;
            node.range = range;
            self.refresh_upward(base);
            return;
        }

        self.len += 1;
        let idx = self
            .nodes
            .allocate_slot(Node::fresh(key, val, range, Color::Red));
        self.node_mut(idx).parent = base;
        if way == Ordering::Greater {
            self.node_mut(base).right = idx;
        } else {
            self.node_mut(base).left = idx;
        }

        self.refresh_upward(base);
        self.fix_insert(idx);
        self.node_mut(self.root).color = Color::Black;
    }

    /// Removes `key` if present. Removing the last entry retracts the node
    /// arena wholesale instead of releasing slots one at a time.
    pub fn remove(&mut self, key: K) -> bool {
        let (idx, way) = self.descend(key);
        if idx == NIL || way != Ordering::Equal {
            return false;
        }
        self.remove_node(idx);
        true
    }

    /// Updates the range of an existing entry; absent keys are ignored.
    pub fn range_set(&mut self, key: K, range: R) {
        let (idx, way) = self.descend(key);
        if idx == NIL || way != Ordering::Equal {
            return;
        }
        self.node_mut(idx).range = range;
        self.refresh_upward(idx);
    }

    /// Entry with the smallest key, if any.
    #[must_use]
    pub fn first(&self) -> Option<Entry<K, V>> {
        if self.root == NIL {
            return None;
        }
        self.entry_at(self.leftmost(self.root))
    }

    /// Entry with the largest key, if any.
    #[must_use]
    pub fn last(&self) -> Option<Entry<K, V>> {
        if self.root == NIL {
            return None;
        }
        self.entry_at(self.rightmost(self.root))
    }

    /// In-order successor of `key`, which must be present.
    #[must_use]
    pub fn next(&self, key: K) -> Option<Entry<K, V>> {
        let (idx, way) = self.descend(key);
        if idx == NIL || way != Ordering::Equal {
            die(HeapFault::MissingTreeKey);
        }
        self.entry_at(self.successor(idx))
    }

    /// In-order predecessor of `key`, which must be present.
    #[must_use]
    pub fn prev(&self, key: K) -> Option<Entry<K, V>> {
        let (idx, way) = self.descend(key);
        if idx == NIL || way != Ordering::Equal {
            die(HeapFault::MissingTreeKey);
        }
        self.entry_at(self.predecessor(idx))
    }

    /// True when any stored range falls inside `[min, max]`.
    #[must_use]
    pub fn range_overlap(&self, min: R, max: R) -> bool {
        self.overlap(self.root, min, max)
    }

    /// Finds an entry whose range lies in `[min, max]` and passes `test`.
    ///
    /// The walk descends into every subtree whose cached window overlaps
    /// the request, left side first. When both children overlap, the node
    /// is parked on a small backtrack stack; a dead end pops it and resumes
    /// down the right side. Trees deep enough to overflow the stack are
    /// corrupt by construction and abort.
    pub fn range_fit(
        &self,
        min: R,
        max: R,
        mut test: impl FnMut(K, V) -> bool,
    ) -> Option<Entry<K, V>> {
        if !self.overlap(self.root, min, max) {
            return None;
        }

        let mut stack = [NIL; FIT_STACK_DEPTH];
        let mut depth = 0usize;
        let mut resume_right = false;

        let mut head = self.root;
        while head != NIL {
            let n = self.node(head);
            if min <= n.range && max >= n.range && test(n.key, n.val) {
                return Some(Entry { key: n.key, val: n.val });
            }

            let overlap_l = self.overlap(n.left, min, max);
            let overlap_r = self.overlap(n.right, min, max);

            if overlap_l && overlap_r {
                if resume_right {
                    resume_right = false;
                    head = n.right;
                    continue;
                }
                if depth >= FIT_STACK_DEPTH {
                    die(HeapFault::TraversalOverflow);
                }
                stack[depth] = head;
                depth += 1;
                head = n.left;
                continue;
            }
            if overlap_l {
                head = n.left;
                continue;
            }
            if overlap_r {
                head = n.right;
                continue;
            }
            if depth > 0 {
                depth -= 1;
                head = stack[depth];
                resume_right = true;
                continue;
            }
            return None;
        }
        None
    }

    /// Entry holding the smallest range in the whole map.
    #[must_use]
    pub fn range_min(&self) -> Option<Entry<K, V>> {
        if self.root == NIL {
            return None;
        }
        let m = self.node(self.root).min;
        self.range_fit(m, m, |_, _| true)
    }

    /// Entry holding the largest range in the whole map.
    #[must_use]
    pub fn range_max(&self) -> Option<Entry<K, V>> {
        if self.root == NIL {
            return None;
        }
        let m = self.node(self.root).max;
        self.range_fit(m, m, |_, _| true)
    }

    /// Finds the entry with the smallest range that is `>= limit`.
    ///
    /// The descent is guided by the cached windows and only chooses one
    /// branch per level, so it requires ranges to sort the same way as keys
    /// (range == key order). Other layouts make the branch choice unsound.
    #[must_use]
    pub fn range_minimize(&self, limit: R) -> Option<Entry<K, V>> {
        let mut head = self.root;
        let mut best = NIL;
        while head != NIL {
            let n = self.node(head);
            if n.max < limit {
                break;
            }
            if n.range >= limit && (best == NIL || n.range <= self.node(best).range) {
                best = head;
            }

            let left = self.child_window_min(n.left, limit);
            let right = self.child_window_min(n.right, limit);
            let (side, side_min) = match (left, right) {
                (None, None) => break,
                (Some((l_min, _)), None) => (n.left, l_min),
                (None, Some((r_min, _))) => (n.right, r_min),
                (Some((l_min, l_max)), Some((r_min, r_max))) => {
                    if l_min < r_min || (l_min == r_min && l_max <= r_max) {
                        (n.left, l_min)
                    } else {
                        (n.right, r_min)
                    }
                }
            };

            if n.range < limit || n.range > side_min {
                head = side;
                continue;
            }
            break;
        }
        self.entry_at(best)
    }

    /// Finds the entry with the largest range that is `<= limit`.
    ///
    /// Same precondition as [`range_minimize`]: ranges must sort the same
    /// way as keys.
    ///
    /// [`range_minimize`]: RangeMap::range_minimize
    #[must_use]
    pub fn range_maximize(&self, limit: R) -> Option<Entry<K, V>> {
        let mut head = self.root;
        let mut best = NIL;
        while head != NIL {
            let n = self.node(head);
            if n.min > limit {
                break;
            }
            if n.range <= limit && (best == NIL || n.range >= self.node(best).range) {
                best = head;
            }

            let left = self.child_window_max(n.left, limit);
            let right = self.child_window_max(n.right, limit);
            let (side, side_max) = match (left, right) {
                (None, None) => break,
                (Some((_, l_max)), None) => (n.left, l_max),
                (None, Some((_, r_max))) => (n.right, r_max),
                (Some((l_min, l_max)), Some((r_min, r_max))) => {
                    if l_min > r_min || (l_min == r_min && l_max >= r_max) {
                        (n.left, l_max)
                    } else {
                        (n.right, r_max)
                    }
                }
            };

            if n.range > limit || n.range <= side_max {
                head = side;
                continue;
            }
            break;
        }
        self.entry_at(best)
    }

    /// In-order walk over all entries.
    pub fn iter(&self) -> Iter<'_, K, V, R> {
        let at = if self.root == NIL {
            NIL
        } else {
            self.leftmost(self.root)
        };
        Iter { map: self, at }
    }

    /// Test auditor. Panics when the tree violates its structural rules:
    /// parent links, key order, red-black coloring, or cached aggregates.
    pub fn verify_invariants(&self) {
        if self.root == NIL {
            assert_eq!(self.len, 0, "empty tree must report len 0");
            return;
        }
        assert_eq!(self.node(self.root).parent, NIL, "root has no parent");
        assert_eq!(self.node(self.root).color, Color::Black, "root is black");
        let (_, count, _, _) = self.audit_subtree(self.root);
        assert_eq!(count, self.len, "node count matches len");
    }

    fn audit_subtree(&self, idx: SlotIndex) -> (usize, usize, K, K) {
        let n = self.node(idx);
        let mut min = n.range;
        let mut max = n.range;
        let mut count = 1usize;
        let mut lo = n.key;
        let mut hi = n.key;
        let mut black_l = 1usize;
        let mut black_r = 1usize;

        if n.left != NIL {
            let child = self.node(n.left);
            assert_eq!(child.parent, idx, "left child links back to parent");
            if n.color == Color::Red {
                assert_eq!(child.color, Color::Black, "red node has black children");
            }
            let (h, c, c_lo, c_hi) = self.audit_subtree(n.left);
            assert!(c_hi < n.key, "left subtree keys sort below the node");
            black_l = h;
            count += c;
            lo = c_lo;
            if child.min < min {
                min = child.min;
            }
            if child.max > max {
                max = child.max;
            }
        }
        if n.right != NIL {
            let child = self.node(n.right);
            assert_eq!(child.parent, idx, "right child links back to parent");
            if n.color == Color::Red {
                assert_eq!(child.color, Color::Black, "red node has black children");
            }
            let (h, c, c_lo, c_hi) = self.audit_subtree(n.right);
            assert!(c_lo > n.key, "right subtree keys sort above the node");
            black_r = h;
            count += c;
            hi = c_hi;
            if child.min < min {
                min = child.min;
            }
            if child.max > max {
                max = child.max;
            }
        }

        assert_eq!(black_l, black_r, "black height matches across siblings");
        assert!(
            n.min == min && n.max == max,
            "cached aggregates match subtree contents"
        );
        (black_l + usize::from(n.color == Color::Black), count, lo, hi)
    }

    fn node(&self, idx: SlotIndex) -> Node<K, V, R> {
        *self.nodes.get(idx)
    }

    fn node_mut(&mut self, idx: SlotIndex) -> &mut Node<K, V, R> {
        self.nodes.get_mut(idx)
    }

    fn entry_at(&self, idx: SlotIndex) -> Option<Entry<K, V>> {
        if idx == NIL {
            return None;
        }
        let n = self.node(idx);
        Some(Entry {
            key: n.key,
            val: n.val,
        })
    }

    /// Walks toward `key` and returns the last node touched together with
    /// the way the comparison pointed. `Equal` means an exact hit; anything
    /// else names the side of the returned node the key would attach to.
    fn descend(&self, key: K) -> (SlotIndex, Ordering) {
        let mut idx = self.root;
        let mut way = Ordering::Equal;
        while idx != NIL {
            let n = self.node(idx);
            way = key.cmp(&n.key);
            match way {
                Ordering::Equal => return (idx, way),
                Ordering::Greater if n.right != NIL => idx = n.right,
                Ordering::Less if n.left != NIL => idx = n.left,
                _ => return (idx, way),
            }
        }
        (NIL, way)
    }

    fn leftmost(&self, mut idx: SlotIndex) -> SlotIndex {
        while self.node(idx).left != NIL {
            idx = self.node(idx).left;
        }
        idx
    }

    fn rightmost(&self, mut idx: SlotIndex) -> SlotIndex {
        while self.node(idx).right != NIL {
            idx = self.node(idx).right;
        }
        idx
    }

    fn successor(&self, idx: SlotIndex) -> SlotIndex {
        let n = self.node(idx);
        if n.right != NIL {
            return self.leftmost(n.right);
        }
        let mut head = idx;
        loop {
            let parent = self.node(head).parent;
            if parent == NIL {
                return NIL;
            }
            if self.node(parent).left == head {
                return parent;
            }
            head = parent;
        }
    }

    fn predecessor(&self, idx: SlotIndex) -> SlotIndex {
        let n = self.node(idx);
        if n.left != NIL {
            return self.rightmost(n.left);
        }
        let mut head = idx;
        loop {
            let parent = self.node(head).parent;
            if parent == NIL {
                return NIL;
            }
            if self.node(parent).right == head {
                return parent;
            }
            head = parent;
        }
    }

    fn sibling_of(&self, idx: SlotIndex) -> SlotIndex {
        let parent = self.node(idx).parent;
        if parent == NIL {
            return NIL;
        }
        let p = self.node(parent);
        if p.left == idx { p.right } else { p.left }
    }

    fn overlap(&self, idx: SlotIndex, min: R, max: R) -> bool {
        if idx == NIL {
            return false;
        }
        let n = self.node(idx);
        max >= n.min && min <= n.max
    }

    /// Child window for the minimizing descent: present when the child
    /// subtree holds any range `>= limit`.
    fn child_window_min(&self, idx: SlotIndex, limit: R) -> Option<(R, R)> {
        if idx == NIL {
            return None;
        }
        let n = self.node(idx);
        if n.max >= limit { Some((n.min, n.max)) } else { None }
    }

    /// Child window for the maximizing descent: present when the child
    /// subtree holds any range `<= limit`.
    fn child_window_max(&self, idx: SlotIndex, limit: R) -> Option<(R, R)> {
        if idx == NIL {
            return None;
        }
        let n = self.node(idx);
        if n.min <= limit { Some((n.min, n.max)) } else { None }
    }

    /// Recomputes `idx`'s cached window from its own range and its
    /// children's windows. Returns whether the stored values changed.
    fn recompute(&mut self, idx: SlotIndex) -> bool {
        let n = self.node(idx);
        let mut min = n.range;
        let mut max = n.range;
        if n.left != NIL {
            let l = self.node(n.left);
            if l.min < min {
                min = l.min;
            }
            if l.max > max {
                max = l.max;
            }
        }
        if n.right != NIL {
            let r = self.node(n.right);
            if r.min < min {
                min = r.min;
            }
            if r.max > max {
                max = r.max;
            }
        }
        if min == n.min && max == n.max {
            return false;
        }
        let node = self.node_mut(idx);
        node.min = min;
        node.max = max;
        true
    }

    /// Refreshes cached windows from `idx` toward the root, stopping at the
    /// first node whose window absorbs the change. Callers start the walk at
    /// the lowest node whose inputs changed.
    fn refresh_upward(&mut self, mut idx: SlotIndex) {
        while idx != NIL && self.recompute(idx) {
            idx = self.node(idx).parent;
        }
    }

    fn swap_colors(&mut self, a: SlotIndex, b: SlotIndex) {
        let color_a = self.node(a).color;
        let color_b = self.node(b).color;
        self.node_mut(a).color = color_b;
        self.node_mut(b).color = color_a;
    }

    fn rotate_left(&mut self, node: SlotIndex) {
        let pivot = self.node(node).right;
        if pivot == NIL {
            return;
        }
        let inner = self.node(pivot).left;
        self.node_mut(node).right = inner;
        if inner != NIL {
            self.node_mut(inner).parent = node;
        }

        let parent = self.node(node).parent;
        self.node_mut(pivot).parent = parent;
        if parent == NIL {
            self.root = pivot;
        } else if self.node(parent).left == node {
            self.node_mut(parent).left = pivot;
        } else {
            self.node_mut(parent).right = pivot;
        }

        self.node_mut(pivot).left = node;
        self.node_mut(node).parent = pivot;

        // The rotation moved no entry in or out of the pair's subtree, so
        // only the two repositioned nodes need fresh windows.
        self.recompute(node);
        self.recompute(pivot);
    }

    fn rotate_right(&mut self, node: SlotIndex) {
        let pivot = self.node(node).left;
        if pivot == NIL {
            return;
        }
        let inner = self.node(pivot).right;
        self.node_mut(node).left = inner;
        if inner != NIL {
            self.node_mut(inner).parent = node;
        }

        let parent = self.node(node).parent;
        self.node_mut(pivot).parent = parent;
        if parent == NIL {
            self.root = pivot;
        } else if self.node(parent).left == node {
            self.node_mut(parent).left = pivot;
        } else {
            self.node_mut(parent).right = pivot;
        }

        self.node_mut(pivot).right = node;
        self.node_mut(node).parent = pivot;

        self.recompute(node);
        self.recompute(pivot);
    }

    fn fix_insert(&mut self, node: SlotIndex) {
        let parent = self.node(node).parent;
        if parent == NIL {
            debug_assert_eq!(node, self.root);
            self.node_mut(node).color = Color::Black;
            return;
        }
        if self.node(parent).color == Color::Black {
            return;
        }

        let grand = self.node(parent).parent;
        if grand == NIL {
            // a red parent without a grandparent is the root
            self.node_mut(parent).color = Color::Black;
            return;
        }

        let uncle = self.sibling_of(parent);
        if uncle != NIL && self.node(uncle).color == Color::Red {
            self.node_mut(parent).color = Color::Black;
            self.node_mut(uncle).color = Color::Black;
            self.node_mut(grand).color = Color::Red;
            self.fix_insert(grand);
            return;
        }

        let node_is_left = self.node(parent).left == node;
        let parent_is_left = self.node(grand).left == parent;
        match (node_is_left, parent_is_left) {
            (true, true) => {
                self.swap_colors(parent, grand);
                self.rotate_right(grand);
            }
            (false, false) => {
                self.swap_colors(parent, grand);
                self.rotate_left(grand);
            }
            (true, false) => {
                self.swap_colors(node, grand);
                self.rotate_right(parent);
                self.rotate_left(grand);
            }
            (false, true) => {
                self.swap_colors(node, grand);
                self.rotate_left(parent);
                self.rotate_right(grand);
            }
        }
        self.node_mut(self.root).color = Color::Black;
    }

    fn remove_node(&mut self, node: SlotIndex) {
        self.len -= 1;
        if self.len == 0 {
            self.clear();
            return;
        }

        let n = self.node(node);

        if n.left == NIL && n.right == NIL {
            // leaf, never the root since other entries remain
            let sibling = self.sibling_of(node);
            self.splice_out(node, NIL);
            self.fix_delete(node, NIL, sibling);
            self.nodes.release_slot(node);
            return;
        }

        if n.left != NIL && n.right != NIL {
            // Two children: the in-order predecessor donates its entry,
            // then gets removed in its place further down the tree.
            let donor = self.rightmost(n.left);
            let d = self.node(donor);
            {
                let target = self.node_mut(node);
                target.key = d.key;
                target.val = d.val;
                target.range = d.range;
            }
            let child = d.left;
            let sibling = self.sibling_of(donor);
            self.splice_out(donor, child);
            self.fix_delete(donor, child, sibling);
            self.nodes.release_slot(donor);
            // The donated range may widen or shrink windows on the path
            // above the surviving node.
            self.refresh_upward(node);
            return;
        }

        let child = if n.left != NIL { n.left } else { n.right };
        if node == self.root {
            self.root = child;
            let c = self.node_mut(child);
            c.parent = NIL;
            c.color = Color::Black;
            self.nodes.release_slot(node);
            return;
        }

        let sibling = self.sibling_of(node);
        self.splice_out(node, child);
        self.fix_delete(node, child, sibling);
        self.nodes.release_slot(node);
    }

    /// Replaces `node` with `child` (possibly `NIL`) in its parent's eyes
    /// and refreshes windows from the parent upward. `node` keeps its own
    /// link fields so the delete fixup can still read them.
    fn splice_out(&mut self, node: SlotIndex, child: SlotIndex) {
        let parent = self.node(node).parent;
        if parent == NIL {
            self.root = child;
        } else if self.node(parent).left == node {
            self.node_mut(parent).left = child;
        } else {
            self.node_mut(parent).right = child;
        }
        if child != NIL {
            self.node_mut(child).parent = parent;
        }
        self.refresh_upward(parent);
    }

    fn fix_delete(&mut self, node: SlotIndex, child: SlotIndex, sibling: SlotIndex) {
        // removing a red node disturbs nothing
        if self.node(node).color == Color::Red {
            return;
        }
        // a red child absorbs the lost black height
        if child != NIL && self.node(child).color == Color::Red {
            self.node_mut(child).color = Color::Black;
            return;
        }
        let parent = self.node(node).parent;
        self.fix_double_black(child, sibling, parent);
        if self.root != NIL {
            self.node_mut(self.root).color = Color::Black;
        }
    }

    fn fix_double_black(&mut self, current: SlotIndex, sibling: SlotIndex, parent: SlotIndex) {
        if parent == NIL {
            return;
        }

        // No sibling: the deficit moves up a level.
        if sibling == NIL {
            if parent == self.root {
                return;
            }
            if self.node(parent).color == Color::Red {
                self.node_mut(parent).color = Color::Black;
                return;
            }
            let uncle = self.sibling_of(parent);
            let grand = self.node(parent).parent;
            self.fix_double_black(parent, uncle, grand);
            return;
        }

        // Red sibling: rotate it over the parent, then re-resolve against
        // the new sibling, which is black.
        let mut sibling = sibling;
        if self.node(sibling).color == Color::Red {
            self.swap_colors(parent, sibling);
            if current == self.node(parent).left {
                self.rotate_left(parent);
            } else if current == self.node(parent).right {
                self.rotate_right(parent);
            }
            sibling = if current != NIL {
                self.sibling_of(current)
            } else {
                let p = self.node(parent);
                if p.left == NIL { p.right } else { p.left }
            };
            if sibling == NIL {
                let grand = self.node(parent).parent;
                self.fix_double_black(parent, NIL, grand);
                return;
            }
        }

        let s = self.node(sibling);
        let s_left_black = s.left == NIL || self.node(s.left).color == Color::Black;
        let s_right_black = s.right == NIL || self.node(s.right).color == Color::Black;

        // Black sibling with black children: recolor and push the deficit
        // up unless the parent can swallow it.
        if s_left_black && s_right_black {
            self.node_mut(sibling).color = Color::Red;
            if parent == self.root || self.node(parent).color == Color::Red {
                self.node_mut(parent).color = Color::Black;
                return;
            }
            let uncle = self.sibling_of(parent);
            let grand = self.node(parent).parent;
            self.fix_double_black(parent, uncle, grand);
            return;
        }

        let is_left = self.node(parent).left == current;

        // Far child red: one rotation settles the deficit.
        let far_red = if is_left { !s_right_black } else { !s_left_black };
        if far_red {
            self.swap_colors(parent, sibling);
            if is_left {
                self.rotate_left(parent);
                let grand = self.node(parent).parent;
                if grand != NIL {
                    let far = self.node(grand).right;
                    if far != NIL {
                        self.node_mut(far).color = Color::Black;
                    }
                }
            } else {
                self.rotate_right(parent);
                let grand = self.node(parent).parent;
                if grand != NIL {
                    let far = self.node(grand).left;
                    if far != NIL {
                        self.node_mut(far).color = Color::Black;
                    }
                }
            }
            return;
        }

        // Near child red: rotate it outward first, then settle as above.
        if is_left {
            self.node_mut(s.left).color = Color::Black;
            self.node_mut(sibling).color = Color::Red;
            self.rotate_right(sibling);

            let sibling = self.node(parent).right;
            self.swap_colors(parent, sibling);
            self.rotate_left(parent);

            let far = self.node(sibling).right;
            if far != NIL {
                self.node_mut(far).color = Color::Black;
            }
        } else {
            self.node_mut(s.right).color = Color::Black;
            self.node_mut(sibling).color = Color::Red;
            self.rotate_left(sibling);

            let sibling = self.node(parent).left;
            self.swap_colors(parent, sibling);
            self.rotate_right(parent);

            let far = self.node(sibling).left;
            if far != NIL {
                self.node_mut(far).color = Color::Black;
            }
        }
    }
}

/// In-order iterator over a [`RangeMap`], driven by parent links.
pub struct Iter<'a, K: Copy + Ord, V: Copy, R: Copy + Ord> {
    map: &'a RangeMap<K, V, R>,
    at: SlotIndex,
}

impl<K: Copy + Ord, V: Copy, R: Copy + Ord> Iterator for Iter<'_, K, V, R> {
    type Item = Entry<K, V>;

    fn next(&mut self) -> Option<Entry<K, V>> {
        if self.at == NIL {
            return None;
        }
        let out = self.map.entry_at(self.at);
        self.at = self.map.successor(self.at);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLAB: usize = 64 * 1024;

    /// Builds a map where every entry's range equals its key, checking the
    /// structure after each insertion.
    fn keyed(keys: &[u64]) -> RangeMap<u64, u64, u64> {
        let mut map = RangeMap::new(SLAB);
        for &k in keys {
            map.put(k, k * 10, k);
            map.verify_invariants();
        }
        map
    }

    #[test]
    fn put_then_lookup_round_trips() {
        let map = keyed(&[50, 20, 70, 10, 30, 60, 80]);
        assert_eq!(map.len(), 7);
        for k in [10u64, 20, 30, 50, 60, 70, 80] {
            assert!(map.contains(k));
            assert_eq!(map.at(k), k * 10);
        }
        assert!(!map.contains(40));
        assert!(!map.contains(0));
    }

    #[test]
    fn overwrite_updates_value_and_range() {
        let mut map = keyed(&[5, 3, 8]);
        map.put(3, 999, 100);
        map.verify_invariants();
        assert_eq!(map.len(), 3);
        assert_eq!(map.at(3), 999);
        assert_eq!(map.range_max().map(|e| e.key), Some(3));
    }

    #[test]
    fn ordered_walk_visits_keys_in_order() {
        let map = keyed(&[9, 2, 7, 1, 5, 8, 3, 6, 4]);
        let keys: Vec<u64> = map.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);

        assert_eq!(map.first().map(|e| e.key), Some(1));
        assert_eq!(map.last().map(|e| e.key), Some(9));
        assert_eq!(map.next(4).map(|e| e.key), Some(5));
        assert_eq!(map.prev(4).map(|e| e.key), Some(3));
        assert_eq!(map.next(9), None);
        assert_eq!(map.prev(1), None);
    }

    #[test]
    fn removal_keeps_tree_valid() {
        let mut map = keyed(&[50, 20, 70, 10, 30, 60, 80, 25, 35, 65]);
        // leaf, one-child, and two-children victims
        for k in [25u64, 30, 50, 10, 70] {
            assert!(map.remove(k));
            map.verify_invariants();
            assert!(!map.contains(k));
        }
        assert!(!map.remove(999));
        assert_eq!(map.len(), 5);
        let keys: Vec<u64> = map.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![20, 35, 60, 65, 80]);
    }

    #[test]
    fn remove_last_entry_resets_node_storage() {
        let mut map = keyed(&[4, 2, 6]);
        let reserved = map.bytes_reserved();
        for k in [2u64, 6, 4] {
            assert!(map.remove(k));
            map.verify_invariants();
        }
        assert!(map.is_empty());
        assert_eq!(map.first(), None);
        assert_eq!(map.bytes_reserved(), reserved);

        map.put(11, 110, 11);
        map.verify_invariants();
        assert_eq!(map.at(11), 110);
        assert_eq!(map.bytes_reserved(), reserved);
    }

    #[test]
    fn range_fit_honors_window_and_predicate() {
        let map = keyed(&[10, 20, 30, 40, 50]);
        let hit = map.range_fit(25, 45, |_, _| true);
        assert!(matches!(hit, Some(e) if e.key == 30 || e.key == 40));

        let none = map.range_fit(41, 49, |_, _| true);
        assert_eq!(none, None);

        let picky = map.range_fit(5, 55, |k, _| k == 40);
        assert_eq!(picky.map(|e| e.key), Some(40));

        let rejected = map.range_fit(5, 55, |_, _| false);
        assert_eq!(rejected, None);
    }

    #[test]
    fn range_fit_resumes_right_subtree_after_dead_end() {
        // Both subtrees of the root overlap the window, but only one key
        // passes the predicate, so the walk has to back out of the left
        // side and resume on the right.
        let map = keyed(&[4, 2, 6, 1, 3, 5, 7]);
        let hit = map.range_fit(1, 7, |k, _| k == 7);
        assert_eq!(hit.map(|e| e.key), Some(7));
    }

    #[test]
    fn range_extremes_follow_aggregates() {
        let mut map = RangeMap::new(SLAB);
        for (k, r) in [(1u64, 30u64), (2, 10), (3, 50), (4, 20)] {
            map.put(k, 0, r);
        }
        assert_eq!(map.range_min().map(|e| e.key), Some(2));
        assert_eq!(map.range_max().map(|e| e.key), Some(3));

        map.range_set(2, 90);
        map.verify_invariants();
        assert_eq!(map.range_min().map(|e| e.key), Some(4));
        assert_eq!(map.range_max().map(|e| e.key), Some(2));
    }

    #[test]
    fn guided_descents_find_tight_bounds() {
        let map = keyed(&[10, 20, 30, 40]);

        assert_eq!(map.range_minimize(15).map(|e| e.key), Some(20));
        assert_eq!(map.range_minimize(20).map(|e| e.key), Some(20));
        assert_eq!(map.range_minimize(10).map(|e| e.key), Some(10));
        assert_eq!(map.range_minimize(41), None);

        assert_eq!(map.range_maximize(15).map(|e| e.key), Some(10));
        assert_eq!(map.range_maximize(40).map(|e| e.key), Some(40));
        assert_eq!(map.range_maximize(9), None);
    }

    #[test]
    fn empty_map_answers_every_query_quietly() {
        let map: RangeMap<u64, u64, u64> = RangeMap::new(SLAB);
        assert!(map.is_empty());
        assert_eq!(map.first(), None);
        assert_eq!(map.last(), None);
        assert_eq!(map.range_min(), None);
        assert_eq!(map.range_minimize(0), None);
        assert_eq!(map.range_maximize(u64::MAX), None);
        assert!(!map.range_overlap(0, u64::MAX));
        assert_eq!(map.range_fit(0, u64::MAX, |_, _| true), None);
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Corruption]")]
    fn lookup_of_absent_key_is_fatal() {
        let map = keyed(&[1, 2, 3]);
        let _ = map.at(9);
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Corruption]")]
    fn successor_of_absent_key_is_fatal() {
        let map = keyed(&[1, 2, 3]);
        let _ = map.next(9);
    }
}
