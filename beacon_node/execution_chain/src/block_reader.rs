//! Header lookups, and the search for the block that was current at a given time.

use crate::rpc::{BatchElem, BlockHeader};
use crate::service::{unix_now, Error, Service};
use slog::debug;
use types::Hash256;

/// Jumps land within this many blocks' worth of seconds of the target before the search switches
/// to a linear scan. Twice this many jumps are attempted.
pub const SEARCH_THRESHOLD: u64 = 5;

impl Service {
    /// Returns the header at `number`, from the header cache where possible.
    pub async fn retrieve_header_info(&self, number: u64) -> Result<BlockHeader, Error> {
        if let Some(header) = self.inner.header_cache.header_by_height(number) {
            return Ok(header);
        }
        let header = self.inner.rpc.header_by_number(Some(number)).await?;
        self.inner.header_cache.add_header(header.clone())?;
        Ok(header)
    }

    pub async fn header_by_hash(&self, hash: Hash256) -> Result<BlockHeader, Error> {
        if let Some(header) = self.inner.header_cache.header_by_hash(&hash) {
            return Ok(header);
        }
        let header = self.inner.rpc.header_by_hash(hash).await?;
        self.inner.header_cache.add_header(header.clone())?;
        Ok(header)
    }

    /// Returns the height of the block with `hash`, or `None` if the execution node does not know
    /// it.
    pub async fn block_exists(&self, hash: Hash256) -> Result<Option<u64>, Error> {
        match self.header_by_hash(hash).await {
            Ok(header) => Ok(Some(header.number)),
            Err(Error::Rpc(crate::rpc::RpcError::BlockNotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn block_hash_by_height(&self, number: u64) -> Result<Hash256, Error> {
        Ok(self.retrieve_header_info(number).await?.hash)
    }

    /// Returns the latest block with a timestamp at or before `time`.
    ///
    /// Estimates the height from the average block time and jumps towards it a bounded number of
    /// times, then walks linearly to the exact block. Jumps are clamped to the heights the target
    /// can still be at, so an estimate past the head or below block 0 narrows the search rather
    /// than ending it.
    pub async fn block_by_timestamp(&self, time: u64) -> Result<BlockHeader, Error> {
        let latest = self.latest_execution_data();
        if time > latest.block_time {
            return Err(Error::TimeTooLate {
                requested: time,
                latest: latest.block_time,
            });
        }

        let seconds_per_block = self.inner.spec.seconds_per_execution_block.max(1);
        let buffer = SEARCH_THRESHOLD * seconds_per_block;
        let mut cursor = self.retrieve_header_info(latest.block_height).await?;
        // The target is within `low..=high`, assuming timestamps never decrease.
        let mut low = 0;
        let mut high = latest.block_height;

        for _ in 0..2 * SEARCH_THRESHOLD {
            self.check_cancelled()?;
            if cursor.timestamp > time {
                high = cursor
                    .number
                    .checked_sub(1)
                    .ok_or(Error::NoBlockBeforeTimestamp { time })?;
            } else {
                low = cursor.number;
            }
            if low >= high {
                break;
            }

            let next = if time > cursor.timestamp.saturating_add(buffer) {
                let jump = (time - cursor.timestamp) / seconds_per_block;
                cursor.number.saturating_add(jump)
            } else if time.saturating_add(buffer) < cursor.timestamp {
                let jump = (cursor.timestamp - time) / seconds_per_block;
                cursor.number.saturating_sub(jump)
            } else {
                break;
            };
            let next = next.clamp(low, high);
            if next == cursor.number {
                break;
            }
            cursor = self.retrieve_header_info(next).await?;
        }
        if low == high && cursor.number != low {
            cursor = self.retrieve_header_info(low).await?;
        }

        if cursor.timestamp == time {
            Ok(cursor)
        } else if cursor.timestamp > time {
            self.find_less_than_target(cursor, time).await
        } else {
            self.find_more_than_target(cursor, time, latest.block_height)
                .await
        }
    }

    /// Walks down from `header` to the first block at or before `time`.
    async fn find_less_than_target(
        &self,
        mut header: BlockHeader,
        time: u64,
    ) -> Result<BlockHeader, Error> {
        while header.timestamp > time {
            self.check_cancelled()?;
            let Some(previous) = header.number.checked_sub(1) else {
                return Err(Error::NoBlockBeforeTimestamp { time });
            };
            header = self.retrieve_header_info(previous).await?;
        }
        Ok(header)
    }

    /// Walks up from `header`, which is before `time`, to the last block at or before `time`.
    async fn find_more_than_target(
        &self,
        mut header: BlockHeader,
        time: u64,
        head: u64,
    ) -> Result<BlockHeader, Error> {
        loop {
            self.check_cancelled()?;
            if header.number >= head {
                return Ok(header);
            }
            let next = self.retrieve_header_info(header.number + 1).await?;
            if next.timestamp > time {
                return Ok(header);
            }
            header = next;
        }
    }

    /// The height of the block `execution_follow_distance` blocks' worth of time behind the head.
    ///
    /// On a chain shorter than the follow distance this is the head itself.
    pub async fn followed_block_height(&self) -> Result<u64, Error> {
        let latest = self.latest_execution_data();
        let spec = &self.inner.spec;
        let follow_time = spec
            .execution_follow_distance
            .saturating_mul(spec.seconds_per_execution_block);

        if latest.block_time <= follow_time {
            return Ok(0);
        }
        let target_time = if latest.block_height < spec.execution_follow_distance {
            latest.block_time
        } else {
            latest.block_time - follow_time
        };
        Ok(self.block_by_timestamp(target_time).await?.number)
    }

    /// Fetches the headers in `start..=end` with a single batch call and caches them. Headers the
    /// node failed to return are left out.
    pub async fn batch_request_headers(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<BlockHeader>, Error> {
        if start > end {
            return Ok(vec![]);
        }
        let mut batch = (start..=end)
            .map(BatchElem::header_by_number)
            .collect::<Vec<_>>();
        self.inner.rpc.batch_call(&mut batch).await?;

        let mut headers = Vec::with_capacity(batch.len());
        for elem in batch {
            let Some(result) = elem.result else {
                continue;
            };
            match BlockHeader::from_json(&result) {
                Ok(header) => {
                    self.inner.header_cache.add_header(header.clone())?;
                    headers.push(header);
                }
                Err(e) => debug!(self.log, "Discarding batched header"; "error" => ?e),
            }
        }
        Ok(headers)
    }

    /// Warms the header cache with every block that may be voted upon in the current voting
    /// period, ending at `follow_block`.
    pub(crate) async fn cache_headers_for_voting(&self, follow_block: u64) -> Result<(), Error> {
        let start = self.earliest_voting_block(follow_block).await?;
        let step = self.inner.config.max_log_batch_size.max(1);
        let mut from = start;
        while from <= follow_block {
            self.check_cancelled()?;
            let to = from.saturating_add(step - 1).min(follow_block);
            self.batch_request_headers(from, to).await?;
            from = to + 1;
        }
        Ok(())
    }

    async fn earliest_voting_block(&self, follow_block: u64) -> Result<u64, Error> {
        let spec = &self.inner.spec;
        let genesis_time = self.chain_start_data().genesis_time;
        let now = unix_now();

        // Before genesis, cover the follow distance behind the followed block.
        if genesis_time == 0 || now <= genesis_time {
            return Ok(follow_block.saturating_sub(spec.execution_follow_distance));
        }
        if self.latest_execution_data().block_height < spec.execution_follow_distance {
            return Ok(0);
        }

        let seconds_per_slot = spec.seconds_per_slot.max(1);
        let current_slot = (now - genesis_time) / seconds_per_slot;
        let period_slots = spec.slots_per_eth1_voting_period().max(1);
        let period_start_slot = current_slot - current_slot % period_slots;
        let voting_period_start = genesis_time + period_start_slot * seconds_per_slot;

        let follow_back = 2 * spec.seconds_per_execution_block * spec.execution_follow_distance;
        let earliest_time = voting_period_start.saturating_sub(follow_back);
        if earliest_time <= genesis_time {
            return Ok(0);
        }
        Ok(self.block_by_timestamp(earliest_time).await?.number)
    }
}
