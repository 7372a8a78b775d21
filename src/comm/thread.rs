//! In-process process group: every rank is a thread.
//!
//! Ranks meet at a shared rendezvous where each collective is an exchange of
//! one payload per rank; results are derived locally from the published set.
//! Node placement is simulated with a node id per rank, which drives
//! `split_shared` and `processor_name`.
//!
//! # Usage
//!
//! ```
//! use teamsolve::comm::{ProcessGroup, ThreadGroup};
//!
//! let sums = ThreadGroup::run(&[0, 0, 1, 1], |group| group.all_reduce_sum(1.0));
//! assert_eq!(sums, vec![4.0; 4]);
//! ```

use super::{Element, ProcessGroup, SegmentTable};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

type Payload = Arc<dyn Any + Send + Sync>;

/// Meeting point shared by all members of one group.
struct Rendezvous {
    size: usize,
    state: Mutex<RendezvousState>,
    turn: Condvar,
}

struct RendezvousState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Payload>>,
    published: Arc<Vec<Payload>>,
}

impl Rendezvous {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            state: Mutex::new(RendezvousState {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                published: Arc::new(Vec::new()),
            }),
            turn: Condvar::new(),
        })
    }

    /// Deposit `payload` for `rank` and block until every member has done the
    /// same; returns all payloads in rank order.
    fn exchange(&self, rank: usize, payload: Payload) -> Arc<Vec<Payload>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = state.generation;
        state.slots[rank] = Some(payload);
        state.arrived += 1;

        if state.arrived == self.size {
            let published: Vec<Payload> = state.slots.iter_mut().filter_map(Option::take).collect();
            state.published = Arc::new(published);
            state.arrived = 0;
            state.generation += 1;
            self.turn.notify_all();
            return Arc::clone(&state.published);
        }

        // The next generation cannot complete before this rank returns, so
        // `published` still belongs to our generation when we wake up.
        let state = self
            .turn
            .wait_while(state, |s| s.generation == generation)
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state.published)
    }
}

fn view<T: 'static>(payload: &Payload) -> &T {
    payload
        .downcast_ref::<T>()
        .unwrap_or_else(|| panic!("collective mismatch: ranks entered different collectives"))
}

/// A process group whose members are threads of the current process.
#[derive(Clone)]
pub struct ThreadGroup {
    rank: usize,
    hub: Arc<Rendezvous>,
    /// Node id of every member, indexed by rank.
    nodes: Arc<[usize]>,
}

impl ThreadGroup {
    /// One group handle per rank; `nodes[r]` is the node rank `r` runs on.
    pub fn universe(nodes: &[usize]) -> Vec<ThreadGroup> {
        let hub = Rendezvous::new(nodes.len());
        let nodes: Arc<[usize]> = Arc::from(nodes);
        (0..nodes.len())
            .map(|rank| ThreadGroup {
                rank,
                hub: Arc::clone(&hub),
                nodes: Arc::clone(&nodes),
            })
            .collect()
    }

    /// A group with a single member.
    pub fn single() -> Self {
        let hub = Rendezvous::new(1);
        ThreadGroup {
            rank: 0,
            hub,
            nodes: Arc::from(vec![0]),
        }
    }

    /// Run `f` once per rank on its own thread and collect the results in
    /// rank order.
    pub fn run<R, F>(nodes: &[usize], f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadGroup) -> R + Sync,
    {
        let groups = Self::universe(nodes);
        std::thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    let f = &f;
                    scope.spawn(move || f(group))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }

    /// Node id of this rank.
    pub fn node(&self) -> usize {
        self.nodes[self.rank]
    }

    fn exchange<T: Send + Sync + 'static>(&self, value: T) -> Arc<Vec<Payload>> {
        self.hub.exchange(self.rank, Arc::new(value))
    }

    fn split_members(&self, color: Option<u32>, key: usize) -> Option<ThreadGroup> {
        let entries = self.exchange((color, key));
        let entries: Vec<(Option<u32>, usize)> = entries
            .iter()
            .map(|p| *view::<(Option<u32>, usize)>(p))
            .collect();

        let members: Vec<usize> = match color {
            Some(c) => {
                let mut m: Vec<usize> = (0..entries.len())
                    .filter(|&r| entries[r].0 == Some(c))
                    .collect();
                m.sort_by_key(|&r| (entries[r].1, r));
                m
            }
            None => Vec::new(),
        };

        // The first member of each new group creates its rendezvous; a second
        // exchange hands it to the other members.
        let created = (members.first() == Some(&self.rank)).then(|| Rendezvous::new(members.len()));
        let hubs = self.exchange(created);

        let &leader = members.first()?;
        let hub = view::<Option<Arc<Rendezvous>>>(&hubs[leader]).clone()?;
        let rank = members.iter().position(|&r| r == self.rank)?;
        let nodes: Arc<[usize]> = members.iter().map(|&r| self.nodes[r]).collect();
        Some(ThreadGroup { rank, hub, nodes })
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.hub.size
    }

    fn processor_name(&self) -> String {
        format!("node{}", self.node())
    }

    fn barrier(&self) {
        self.exchange(());
    }

    fn duplicate(&self) -> Self {
        self.split_members(Some(0), self.rank)
            .unwrap_or_else(|| unreachable!("a defined color always yields a group"))
    }

    fn split(&self, color: Option<u32>, key: usize) -> Option<Self> {
        self.split_members(color, key)
    }

    fn split_shared(&self) -> Self {
        let node = u32::try_from(self.node()).unwrap_or(u32::MAX);
        self.split_members(Some(node), self.rank)
            .unwrap_or_else(|| unreachable!("a defined color always yields a group"))
    }

    fn all_gather<T: Element>(&self, value: T) -> Vec<T> {
        self.exchange(value).iter().map(|p| *view::<T>(p)).collect()
    }

    fn all_reduce_sum(&self, local: f64) -> f64 {
        // Summed in rank order so every member sees the same bits.
        self.exchange(local).iter().map(|p| *view::<f64>(p)).sum()
    }

    fn all_reduce_sum_u64(&self, local: u64) -> u64 {
        self.exchange(local).iter().map(|p| *view::<u64>(p)).sum()
    }

    fn all_reduce_sum_vec(&self, local: &mut [f64]) {
        let parts = self.exchange(local.to_vec());
        local.iter_mut().for_each(|v| *v = 0.0);
        for part in parts.iter() {
            let part = view::<Vec<f64>>(part);
            assert_eq!(part.len(), local.len(), "all_reduce_sum_vec length mismatch");
            for (acc, &v) in local.iter_mut().zip(part) {
                *acc += v;
            }
        }
    }

    fn broadcast<T: Element>(&self, root: usize, data: &mut [T]) {
        let sent = (self.rank == root).then(|| data.to_vec());
        let parts = self.exchange(sent);
        if self.rank != root {
            match view::<Option<Vec<T>>>(&parts[root]) {
                Some(values) => data.copy_from_slice(values),
                None => panic!("collective mismatch: broadcast root sent nothing"),
            }
        }
    }

    fn gather_varcount<T: Element>(&self, local: &[T], table: &SegmentTable) -> Option<Vec<T>> {
        assert_eq!(
            table.counts()[self.rank],
            local.len(),
            "gather_varcount: segment table disagrees with local length"
        );
        let parts = self.exchange(local.to_vec());
        if self.rank != 0 {
            return None;
        }
        let mut out = Vec::with_capacity(table.total());
        for part in parts.iter() {
            out.extend_from_slice(view::<Vec<T>>(part));
        }
        Some(out)
    }

    fn scatter_varcount<T: Element>(&self, global: Option<&[T]>, table: &SegmentTable, out: &mut [T]) {
        let sent = if self.rank == 0 {
            global.map(<[T]>::to_vec)
        } else {
            None
        };
        let parts = self.exchange(sent);
        match view::<Option<Vec<T>>>(&parts[0]) {
            Some(values) => out.copy_from_slice(&values[table.segment(self.rank)]),
            None => panic!("collective mismatch: scatter root sent nothing"),
        }
    }
}

/// Place `ranks` ranks on `nodes` nodes in contiguous blocks whose sizes
/// differ by at most one.
pub fn contiguous_nodes(ranks: usize, nodes: usize) -> Vec<usize> {
    let nodes = nodes.clamp(1, ranks.max(1));
    let basic = ranks / nodes;
    let remain = ranks % nodes;
    (0..nodes)
        .flat_map(|node| std::iter::repeat(node).take(basic + usize::from(node < remain)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_gather_is_rank_ordered() {
        let gathered = ThreadGroup::run(&[0, 0, 0], |g| g.all_gather(g.rank() as i64 * 10));
        for g in gathered {
            assert_eq!(g, vec![0, 10, 20]);
        }
    }

    #[test]
    fn split_orders_members_by_key_then_rank() {
        // Colors alternate, keys reverse the order inside each color.
        let result = ThreadGroup::run(&[0; 4], |g| {
            let sub = g.split(Some((g.rank() % 2) as u32), 10 - g.rank()).unwrap();
            (sub.rank(), sub.size(), sub.all_gather(g.rank() as u64))
        });
        assert_eq!(result[0], (1, 2, vec![2, 0]));
        assert_eq!(result[2], (0, 2, vec![2, 0]));
        assert_eq!(result[1], (1, 2, vec![3, 1]));
    }

    #[test]
    fn split_with_undefined_color_yields_none() {
        let result = ThreadGroup::run(&[0; 3], |g| {
            let sub = g.split((g.rank() != 1).then_some(0), g.rank());
            sub.map(|s| (s.rank(), s.size()))
        });
        assert_eq!(result, vec![Some((0, 2)), None, Some((1, 2))]);
    }

    #[test]
    fn split_shared_groups_by_node() {
        let result = ThreadGroup::run(&[0, 0, 1, 1, 1], |g| {
            let node = g.split_shared();
            (node.rank(), node.size(), node.processor_name())
        });
        assert_eq!(result[1], (1, 2, "node0".to_string()));
        assert_eq!(result[4], (2, 3, "node1".to_string()));
    }

    #[test]
    fn gather_then_scatter_round_trips() {
        let result = ThreadGroup::run(&[0; 3], |g| {
            let local: Vec<f64> = (0..g.rank() + 1).map(|i| (g.rank() * 10 + i) as f64).collect();
            let table = SegmentTable::from_counts(g.all_gather(local.len() as u64).iter().map(|&c| c as usize).collect());
            let gathered = g.gather_varcount(&local, &table);
            let mut back = vec![0.0; local.len()];
            g.scatter_varcount(gathered.as_deref(), &table, &mut back);
            (gathered, back == local)
        });
        assert_eq!(result[0].0, Some(vec![0.0, 10.0, 11.0, 20.0, 21.0, 22.0]));
        assert!(result[1].0.is_none());
        assert!(result.iter().all(|(_, ok)| *ok));
    }

    #[test]
    fn broadcast_and_reductions() {
        let result = ThreadGroup::run(&[0; 3], |g| {
            let mut data = [g.rank() as i64 + 7];
            g.broadcast(0, &mut data);
            let mut v = vec![g.rank() as f64; 2];
            g.all_reduce_sum_vec(&mut v);
            (data[0], v, g.all_reduce_sum_u64(1))
        });
        for (b, v, n) in result {
            assert_eq!(b, 7);
            assert_eq!(v, vec![3.0, 3.0]);
            assert_eq!(n, 3);
        }
    }

    #[test]
    fn contiguous_nodes_balances_blocks() {
        assert_eq!(contiguous_nodes(5, 2), vec![0, 0, 0, 1, 1]);
        assert_eq!(contiguous_nodes(2, 4), vec![0, 1]);
        assert_eq!(contiguous_nodes(3, 1), vec![0, 0, 0]);
    }
}
