//! Profiling blocks and per-thread profile state.
//!
//! The compiler allocates one block per profile scope (lets, function bodies,
//! select branches) and emits profile operations that the interpreter replays
//! against the running thread's block stack. Report formatting lives outside
//! the core; what the core maintains is the block registry and the call and
//! sample counts the reporter consumes.

use crate::name::Name;

/// Identifies a profiling block within a [`Profile`].
pub type BlockId = usize;

/// A single profiling block.
#[derive(Debug)]
pub struct Block {
    /// Dotted block path name, e.g. `Main.loop!`
    pub name: Name,
    /// Number of times the block was entered
    pub calls: u64,
    /// Number of time samples charged to the block
    pub samples: u64,
}

/// The profile for one compile + run session.
///
/// Block ids are allocated at compile time and are stable for the lifetime of
/// the profile, so instructions can carry raw ids.
#[derive(Debug, Default)]
pub struct Profile {
    blocks: Vec<Block>,
}

impl Profile {
    /// Create an empty profile
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new block, returning its id
    pub fn add_block(&mut self, name: Name) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(Block {
            name,
            calls: 0,
            samples: 0,
        });
        id
    }

    /// Get a block by id
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /// All blocks, in allocation order
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of allocated blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True if no blocks have been allocated
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Look up a block id by its full dotted name, for tests and tooling
    pub fn find_block(&self, name: &str) -> Option<BlockId> {
        self.blocks.iter().position(|b| &*b.name.name == name)
    }
}

/// Per-thread profiling state: the stack of blocks the thread is inside.
///
/// Operations take the shared [`Profile`] explicitly; only one thread runs at
/// a time, so there is no contention on the counts.
#[derive(Debug, Default)]
pub struct ProfileThread {
    stack: Vec<BlockId>,
}

impl ProfileThread {
    /// Create a fresh profile thread with an empty block stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Fork a child profile thread for a spawned scheduler thread. The child
    /// starts inside the same blocks as its parent.
    pub fn fork(&self) -> Self {
        Self {
            stack: self.stack.clone(),
        }
    }

    /// Enter a block: push it and count a call
    pub fn enter_block(&mut self, profile: &mut Profile, block: BlockId) {
        profile.blocks[block].calls += 1;
        self.stack.push(block);
    }

    /// Exit the current block
    pub fn exit_block(&mut self) {
        self.stack.pop();
    }

    /// Exit the current block on behalf of a frame that is about to be
    /// replaced by a tail call. Semantically the same pop as `exit_block`,
    /// but emitted before the terminating instruction so repeated tail calls
    /// keep the block stack bounded.
    pub fn auto_exit_block(&mut self) {
        self.stack.pop();
    }

    /// Charge one time sample to every block currently on the stack
    pub fn sample(&mut self, profile: &mut Profile) {
        for &block in &self.stack {
            profile.blocks[block].samples += 1;
        }
    }

    /// Current block stack depth, for tests
    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::Loc;

    fn block_name(s: &str) -> Name {
        Name::normal(s, Loc::builtin())
    }

    #[test]
    fn test_add_and_find_blocks() {
        let mut profile = Profile::new();
        let a = profile.add_block(block_name("Main"));
        let b = profile.add_block(block_name("Main.f"));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(profile.find_block("Main.f"), Some(b));
        assert_eq!(profile.find_block("missing"), None);
    }

    #[test]
    fn test_enter_exit_counts() {
        let mut profile = Profile::new();
        let main = profile.add_block(block_name("Main"));
        let inner = profile.add_block(block_name("Main.f"));

        let mut thread = ProfileThread::new();
        thread.enter_block(&mut profile, main);
        thread.enter_block(&mut profile, inner);
        thread.exit_block();
        thread.enter_block(&mut profile, inner);
        thread.exit_block();
        thread.exit_block();

        assert_eq!(profile.block(main).calls, 1);
        assert_eq!(profile.block(inner).calls, 2);
        assert_eq!(thread.depth(), 0);
    }

    #[test]
    fn test_sample_charges_whole_stack() {
        let mut profile = Profile::new();
        let outer = profile.add_block(block_name("Main"));
        let inner = profile.add_block(block_name("Main.f"));

        let mut thread = ProfileThread::new();
        thread.enter_block(&mut profile, outer);
        thread.enter_block(&mut profile, inner);
        thread.sample(&mut profile);

        assert_eq!(profile.block(outer).samples, 1);
        assert_eq!(profile.block(inner).samples, 1);
    }

    #[test]
    fn test_auto_exit_keeps_stack_bounded() {
        let mut profile = Profile::new();
        let body = profile.add_block(block_name("loop!"));

        let mut thread = ProfileThread::new();
        for _ in 0..100 {
            thread.enter_block(&mut profile, body);
            thread.auto_exit_block();
        }
        assert_eq!(thread.depth(), 0);
        assert_eq!(profile.block(body).calls, 100);
    }

    #[test]
    fn test_fork_copies_stack() {
        let mut profile = Profile::new();
        let main = profile.add_block(block_name("Main"));

        let mut parent = ProfileThread::new();
        parent.enter_block(&mut profile, main);
        let child = parent.fork();
        assert_eq!(child.depth(), 1);
    }
}
