//! Scatter splits a vector of the root into one contiguous chunk per rank.
//!
//! Each scatter step gets one single-slot lane per non-root position, so every
//! receiver reads exactly its own chunk.

use crate::{
    communicator::Communicator,
    group::{OpKind, Slot},
    signal::Canceled,
    utils::split_chunks,
};

/// Lane of `rank` in a scatter rooted at `root`; the root has no lane.
fn lane_index(rank: usize, root: usize) -> usize {
    debug_assert_ne!(rank, root);
    if rank < root {
        rank
    } else {
        rank - 1
    }
}

impl<T> Communicator<T> {
    /// Distributes the `items` of rank `root` over the group.
    ///
    /// The items are cut into `size()` contiguous chunks in rank order. With
    /// `n` items the first `n % size()` chunks hold `n / size() + 1` items and
    /// the rest `n / size()`. Every rank, the root included, receives the
    /// chunk at its own rank. The `items` argument of non-root ranks is
    /// ignored.
    ///
    /// # Panics
    /// Panics if `root` is not a rank of this group.
    #[tracing::instrument(level = "trace", skip_all, fields(group = self.group_id(), rank = self.rank, root = root))]
    pub fn scatter(&self, root: usize, items: Vec<T>) -> Result<Vec<T>, Canceled> {
        self.check_root(root, OpKind::Scatter);

        let Some(slot) = self.request_slot(OpKind::Scatter)? else {
            return Ok(items);
        };
        let Slot::Scatter(lanes) = slot else {
            unreachable!("broker answered a scatter with another kind of slot");
        };

        if self.rank != root {
            return self.recv_or_cancel(&lanes[lane_index(self.rank, root)].receiver);
        }

        let mut own = Vec::new();
        for (rank, chunk) in split_chunks(items, self.size()).into_iter().enumerate() {
            if rank == root {
                own = chunk;
            } else {
                self.send_or_cancel(&lanes[lane_index(rank, root)].sender, chunk)?;
            }
        }
        Ok(own)
    }
}

#[cfg(test)]
mod test {
    use super::lane_index;
    use crate::{test::*, Canceled, Controller};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn lanes_skip_the_root() {
        assert_eq!(lane_index(0, 2), 0);
        assert_eq!(lane_index(1, 2), 1);
        assert_eq!(lane_index(3, 2), 2);
        assert_eq!(lane_index(1, 0), 0);
    }

    #[test]
    fn scatter_four_way_from_every_root() -> Result<()> {
        init_logger();

        let size = 4;
        let chunks = Arc::new(Mutex::new(vec![vec![Vec::new(); size]; size]));

        let controller = Controller::<u32>::builder()
            .size(size)
            .task({
                let chunks = chunks.clone();
                move |world, _| {
                    for root in 0..world.size() {
                        let items = if world.rank() == root { (1..=10).collect() } else { vec![] };
                        let chunk = world.scatter(root, items).unwrap();
                        chunks.lock()[root][world.rank()] = chunk;
                    }
                }
            })
            .build()?;
        assert_eq!(controller.run(), 0, "{:?}", controller.panics());

        let expected = vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8], vec![9, 10]];
        for per_root in chunks.lock().iter() {
            assert_eq!(per_root, &expected);
        }
        assert_eq!(controller.pending_steps(), 0);
        Ok(())
    }

    #[test]
    fn scatter_empty_and_short_inputs() -> Result<()> {
        init_logger();

        let controller = Controller::<char>::builder()
            .size(3)
            .task(|world, _| {
                let items = if world.rank() == 1 { vec![] } else { vec!['x'] };
                assert_eq!(world.scatter(1, items).unwrap(), Vec::<char>::new());

                let items = if world.rank() == 2 { vec!['a', 'b'] } else { vec![] };
                let expected = match world.rank() {
                    0 => vec!['a'],
                    1 => vec!['b'],
                    _ => vec![],
                };
                assert_eq!(world.scatter(2, items).unwrap(), expected);
            })
            .build()?;
        assert_eq!(controller.run(), 0, "{:?}", controller.panics());
        Ok(())
    }

    #[test]
    fn scatter_in_subgroup_uses_local_ranks() -> Result<()> {
        init_logger();

        let controller = Controller::<usize>::builder()
            .size(4)
            .group("odd", [3, 1])
            .task(|world, groups| {
                let Some(odd) = groups.get("odd") else {
                    assert!(world.rank() % 2 == 0);
                    return;
                };
                let items = if odd.rank() == 0 { vec![30, 31, 10] } else { vec![] };
                let chunk = odd.scatter(0, items).unwrap();
                match world.rank() {
                    3 => assert_eq!(chunk, vec![30, 31]),
                    1 => assert_eq!(chunk, vec![10]),
                    _ => unreachable!(),
                }
            })
            .build()?;
        assert_eq!(controller.run(), 0, "{:?}", controller.panics());
        Ok(())
    }

    #[test]
    fn scatter_after_quit() -> Result<()> {
        let controller = Controller::<u8>::builder()
            .size(2)
            .task(|world, _| {
                world.quit();
                assert_eq!(world.scatter(0, vec![1, 2]), Err(Canceled));
            })
            .build()?;
        assert_eq!(controller.run(), 0, "{:?}", controller.panics());
        Ok(())
    }
}
