//! Fixed-capacity string multimap stored as a de la Briandais trie.
//!
//! Every node carries one key byte. Children of a node form a sibling list
//! sorted by byte, so a depth-first walk enumerates keys lexicographically.
//!
//! ```text
//!   insert("ab", 1), insert("ac", 2), insert("b", 3), insert("ab", 4)
//!
//!   root ──child──► 'a' ──sibling──► 'b' [3]
//!                    │
//!                  child
//!                    ▼
//!                   'b' [4 → 1] ──sibling──► 'c' [2]
//! ```
//!
//! Values hang off a node as a chain of data nodes, newest first. Nodes and
//! data nodes come from two [`TypedAllocator`] arenas embedded in the tree and
//! are linked with [`RelocatablePtr`]s, so the whole tree (root included)
//! stays valid when moved or byte-copied as one block, e.g. into shared
//! memory.
//!
//! The tree is not synchronised: mutation goes through `&mut self`.

use iox_concurrent::TypedAllocator;
use iox_memory::{Relocatable, RelocatablePtr};
use std::mem::needs_drop;
use std::ptr::{self, NonNull, addr_of, addr_of_mut};

/// Node arena size needed to store `capacity` keys of `max_key_len` bytes
/// that share no prefix.
pub const fn node_capacity(capacity: usize, max_key_len: usize) -> usize {
    capacity * max_key_len
}

#[repr(C)]
struct Node<V> {
    child: RelocatablePtr<Node<V>>,
    sibling: RelocatablePtr<Node<V>>,
    data: RelocatablePtr<DataNode<V>>,
    letter: u8,
}

impl<V> Node<V> {
    const fn new(letter: u8) -> Self {
        Self {
            child: RelocatablePtr::null(),
            sibling: RelocatablePtr::null(),
            data: RelocatablePtr::null(),
            letter,
        }
    }
}

#[repr(C)]
struct DataNode<V> {
    next: RelocatablePtr<DataNode<V>>,
    value: V,
}

/// Multimap from keys of at most `MAX_KEY_LEN` bytes to values, holding at
/// most `CAPACITY` values in total.
///
/// `NODE_CAPACITY` sizes the node arena; use [`node_capacity`] for the worst
/// case.
#[repr(C)]
pub struct PrefixTree<V, const CAPACITY: usize, const MAX_KEY_LEN: usize, const NODE_CAPACITY: usize> {
    /// Stores the empty key.
    root: Node<V>,
    size: usize,
    nodes: TypedAllocator<Node<V>, NODE_CAPACITY>,
    data: TypedAllocator<DataNode<V>, CAPACITY>,
}

impl<V, const CAPACITY: usize, const MAX_KEY_LEN: usize, const NODE_CAPACITY: usize>
    PrefixTree<V, CAPACITY, MAX_KEY_LEN, NODE_CAPACITY>
{
    pub fn new() -> Self {
        Self {
            root: Node::new(0),
            size: 0,
            nodes: TypedAllocator::new(),
            data: TypedAllocator::new(),
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Number of stored values (not keys).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Adds `value` under `key`, in front of values already stored there.
    ///
    /// Returns `false` if the key is too long or an arena is exhausted. A
    /// failed insert leaves the tree unchanged and drops `value`.
    pub fn insert(&mut self, key: &str, value: V) -> bool {
        let letters = key.as_bytes();
        if letters.len() > MAX_KEY_LEN || self.size >= CAPACITY {
            return false;
        }
        let Ok(data) = self.data.create(DataNode {
            next: RelocatablePtr::null(),
            value,
        }) else {
            return false;
        };

        let root = addr_of_mut!(self.root);
        // SAFETY: all nodes are reachable only through `self`, held exclusively.
        unsafe {
            let (node, matched) = longest_match(root, letters);
            let target = if matched == letters.len() {
                node
            } else {
                match add_suffix(&self.nodes, node, &letters[matched..]) {
                    Some(end) => end,
                    None => {
                        self.data.destroy(data);
                        return false;
                    }
                }
            };
            let data = data.as_ptr();
            (*data).next.assign_from(&(*target).data);
            (*target).data.set(data);
        }
        self.size += 1;
        true
    }

    /// Values stored under exactly `key`, newest first.
    pub fn find(&self, key: &str) -> Vec<&V> {
        let mut values = Vec::new();
        // SAFETY: read-only walk over nodes owned by `self`.
        unsafe {
            if let Some(node) = find_node(self.root_ptr(), key.as_bytes()) {
                collect_chain(node, &mut values);
            }
        }
        values
    }

    /// Values of every key that starts with `prefix`.
    pub fn find_prefix(&self, prefix: &str) -> Vec<&V> {
        let mut values = Vec::new();
        // SAFETY: read-only walk over nodes owned by `self`.
        unsafe {
            if let Some(node) = find_node(self.root_ptr(), prefix.as_bytes()) {
                visit_subtree(node, &mut Vec::new(), &mut |_, node| {
                    collect_chain(node, &mut values)
                });
            }
        }
        values
    }

    /// Removes every value stored under `key`.
    ///
    /// Returns `false` if the key held no value.
    pub fn remove(&mut self, key: &str) -> bool {
        let letters = key.as_bytes();
        let root = addr_of_mut!(self.root);
        // SAFETY: exclusive access through `&mut self`.
        unsafe {
            let Some(node) = find_node(root, letters) else {
                return false;
            };
            let mut next = NonNull::new((*node).data.get());
            if next.is_none() {
                return false;
            }
            (*node).data.clear();
            while let Some(data) = next {
                next = NonNull::new(data.as_ref().next.get());
                self.data.destroy(data);
                self.size -= 1;
            }
            prune(&self.nodes, root, letters);
        }
        true
    }

    /// Removes every occurrence of `value` under `key`.
    ///
    /// Returns `false` if `value` was not stored under `key`.
    pub fn remove_value(&mut self, key: &str, value: &V) -> bool
    where
        V: PartialEq,
    {
        let letters = key.as_bytes();
        let root = addr_of_mut!(self.root);
        let mut removed = false;
        // SAFETY: exclusive access through `&mut self`.
        unsafe {
            let Some(node) = find_node(root, letters) else {
                return false;
            };
            let mut link = addr_of_mut!((*node).data);
            while let Some(data) = NonNull::new((*link).get()) {
                let data_ptr = data.as_ptr();
                if (*data_ptr).value == *value {
                    (*link).assign_from(&(*data_ptr).next);
                    self.data.destroy(data);
                    self.size -= 1;
                    removed = true;
                } else {
                    link = addr_of_mut!((*data_ptr).next);
                }
            }
            if removed {
                prune(&self.nodes, root, letters);
            }
        }
        removed
    }

    /// Keys holding at least one value, in lexicographic byte order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        // SAFETY: read-only walk over nodes owned by `self`.
        unsafe {
            visit_subtree(self.root_ptr(), &mut Vec::new(), &mut |key, node| {
                if !(*node).data.is_null() {
                    keys.push(String::from_utf8_lossy(key).into_owned());
                }
            });
        }
        keys
    }

    /// All stored values.
    pub fn values(&self) -> Vec<&V> {
        self.find_prefix("")
    }

    /// Every `(key, value)` pair, keys in lexicographic order.
    pub fn key_value_pairs(&self) -> Vec<(String, &V)> {
        let mut pairs = Vec::new();
        // SAFETY: read-only walk over nodes owned by `self`.
        unsafe {
            visit_subtree(self.root_ptr(), &mut Vec::new(), &mut |key, node| {
                let mut values = Vec::new();
                collect_chain(node, &mut values);
                if !values.is_empty() {
                    let key = String::from_utf8_lossy(key).into_owned();
                    pairs.extend(values.into_iter().map(|v| (key.clone(), v)));
                }
            });
        }
        pairs
    }

    /// Root pointer for read-only walks. Must not be written through.
    #[inline]
    fn root_ptr(&self) -> *mut Node<V> {
        addr_of!(self.root).cast_mut()
    }
}

impl<V, const CAPACITY: usize, const MAX_KEY_LEN: usize, const NODE_CAPACITY: usize> Default
    for PrefixTree<V, CAPACITY, MAX_KEY_LEN, NODE_CAPACITY>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, const CAPACITY: usize, const MAX_KEY_LEN: usize, const NODE_CAPACITY: usize> Drop
    for PrefixTree<V, CAPACITY, MAX_KEY_LEN, NODE_CAPACITY>
{
    fn drop(&mut self) {
        // The arenas never drop their blocks; only values may own resources.
        if !needs_drop::<V>() {
            return;
        }
        let data = &self.data;
        // SAFETY: exclusive access, every data node is destroyed exactly once.
        unsafe {
            visit_subtree(addr_of_mut!(self.root), &mut Vec::new(), &mut |_, node| {
                let mut next = NonNull::new((*node).data.get());
                while let Some(block) = next {
                    next = NonNull::new(block.as_ref().next.get());
                    data.destroy(block);
                }
            });
        }
    }
}

// SAFETY: nodes are private to the tree, mutation requires `&mut self`.
unsafe impl<V: Send, const C: usize, const L: usize, const N: usize> Send for PrefixTree<V, C, L, N> {}
unsafe impl<V: Sync, const C: usize, const L: usize, const N: usize> Sync for PrefixTree<V, C, L, N> {}

// SAFETY: all links are self-relative and point inside the tree.
unsafe impl<V: Relocatable, const C: usize, const L: usize, const N: usize> Relocatable
    for PrefixTree<V, C, L, N>
{
}

// Node helpers. Callers guarantee that every pointer passed in is a live node
// of one tree and that writes only happen under `&mut` access to that tree.

/// Child of `node` labelled `letter`, or null.
unsafe fn find_child<V>(node: *const Node<V>, letter: u8) -> *mut Node<V> {
    unsafe {
        let mut child = (*node).child.get();
        while !child.is_null() {
            match (*child).letter {
                l if l == letter => return child,
                l if l > letter => break,
                _ => child = (*child).sibling.get(),
            }
        }
        ptr::null_mut()
    }
}

/// Deepest node matching a prefix of `letters`, and the matched length.
unsafe fn longest_match<V>(root: *mut Node<V>, letters: &[u8]) -> (*mut Node<V>, usize) {
    let mut node = root;
    for (matched, &letter) in letters.iter().enumerate() {
        let child = unsafe { find_child(node, letter) };
        if child.is_null() {
            return (node, matched);
        }
        node = child;
    }
    (node, letters.len())
}

unsafe fn find_node<V>(root: *mut Node<V>, letters: &[u8]) -> Option<*mut Node<V>> {
    let (node, matched) = unsafe { longest_match(root, letters) };
    (matched == letters.len()).then_some(node)
}

/// Links a new child labelled `letter` into `parent`'s sorted child list.
unsafe fn add_child<V, const N: usize>(
    nodes: &TypedAllocator<Node<V>, N>,
    parent: *mut Node<V>,
    letter: u8,
) -> Option<*mut Node<V>> {
    let new = nodes.create(Node::new(letter)).ok()?.as_ptr();
    unsafe {
        let first = (*parent).child.get();
        if first.is_null() || letter < (*first).letter {
            (*new).sibling.assign_from(&(*parent).child);
            (*parent).child.set(new);
        } else {
            let mut prev = first;
            loop {
                let next = (*prev).sibling.get();
                if next.is_null() || (*next).letter > letter {
                    break;
                }
                prev = next;
            }
            (*new).sibling.assign_from(&(*prev).sibling);
            (*prev).sibling.set(new);
        }
    }
    Some(new)
}

/// Appends a chain of nodes for `suffix` below `node` and returns its end.
///
/// On node exhaustion every node created here is released again and the
/// child list of `node` is restored.
unsafe fn add_suffix<V, const N: usize>(
    nodes: &TypedAllocator<Node<V>, N>,
    node: *mut Node<V>,
    suffix: &[u8],
) -> Option<*mut Node<V>> {
    let (&first_letter, rest) = suffix.split_first()?;
    unsafe {
        let first = add_child(nodes, node, first_letter)?;
        let mut end = first;
        for &letter in rest {
            match nodes.create(Node::new(letter)) {
                Ok(next) => {
                    (*end).child.set(next.as_ptr());
                    end = next.as_ptr();
                }
                Err(_) => {
                    unlink_child(node, first);
                    release_chain(nodes, first);
                    return None;
                }
            }
        }
        Some(end)
    }
}

/// Removes `child` from `parent`'s child list.
unsafe fn unlink_child<V>(parent: *mut Node<V>, child: *mut Node<V>) {
    unsafe {
        if (*parent).child.get() == child {
            (*parent).child.assign_from(&(*child).sibling);
            return;
        }
        let mut prev = (*parent).child.get();
        while !prev.is_null() {
            if (*prev).sibling.get() == child {
                (*prev).sibling.assign_from(&(*child).sibling);
                return;
            }
            prev = (*prev).sibling.get();
        }
    }
}

/// Releases `first` and its single-child chain. The nodes must hold no data.
unsafe fn release_chain<V, const N: usize>(nodes: &TypedAllocator<Node<V>, N>, first: *mut Node<V>) {
    let mut next = NonNull::new(first);
    while let Some(node) = next {
        unsafe {
            next = NonNull::new(node.as_ref().child.get());
            nodes.deallocate(node);
        }
    }
}

/// Releases the nodes on the path to `letters` that no longer lead to data,
/// starting at the end of the path. Stops at the first node that still has
/// data or children; the root is never released.
unsafe fn prune<V, const N: usize>(
    nodes: &TypedAllocator<Node<V>, N>,
    root: *mut Node<V>,
    letters: &[u8],
) {
    let mut path = Vec::with_capacity(letters.len() + 1);
    path.push(root);
    for &letter in letters {
        let Some(&last) = path.last() else { return };
        let next = unsafe { find_child(last, letter) };
        if next.is_null() {
            return;
        }
        path.push(next);
    }

    while let [.., parent, node] = path[..] {
        unsafe {
            if !(*node).data.is_null() || !(*node).child.is_null() {
                break;
            }
            unlink_child(parent, node);
            if let Some(node) = NonNull::new(node) {
                nodes.deallocate(node);
            }
        }
        path.pop();
    }
}

/// Collects the data chain of `node`.
unsafe fn collect_chain<'a, V>(node: *const Node<V>, out: &mut Vec<&'a V>) {
    unsafe {
        let mut data = (*node).data.get();
        while let Some(d) = data.as_ref() {
            out.push(&d.value);
            data = d.next.get();
        }
    }
}

/// Depth-first pre-order walk; `visit` gets the key bytes of each node.
unsafe fn visit_subtree<V, F>(node: *mut Node<V>, key: &mut Vec<u8>, visit: &mut F)
where
    F: FnMut(&[u8], *mut Node<V>),
{
    visit(key, node);
    unsafe {
        let mut child = (*node).child.get();
        while !child.is_null() {
            key.push((*child).letter);
            visit_subtree(child, key, visit);
            key.pop();
            child = (*child).sibling.get();
        }
    }
}
