//! Table definitions for a partition store.
//!
//! Each partition holds six tables: two record tables (blocks and
//! transactions), a meta table for partition-level bookkeeping, and three
//! index tables. All record and index tables map combined byte keys to raw
//! byte values; the meta table is keyed by string.

use redb::TableDefinition;

/// Table definitions used by every partition database.
pub struct Tables;

impl Tables {
    /// Block record fragments, keyed by `combine(checksum, record_kind)`.
    pub const BLOCKS: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("blocks");

    /// Transaction bodies, keyed by `combine(tx_id, record_kind)`.
    pub const TRANSACTIONS: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("transactions");

    /// Partition bookkeeping: format version and min/max block heights.
    pub const META: TableDefinition<'static, &'static str, &'static [u8]> =
        TableDefinition::new("meta");

    /// Height -> checksum primary index plus per-height block metadata,
    /// keyed by `combine(height_be, ...)`.
    pub const IDX_BLOCKS: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("idx_blocks_by_height");

    /// Transactions by applied height and type, keyed by
    /// `combine(applied_be, type ++ txid_prefix)`.
    pub const IDX_TX_APPLIED: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("idx_tx_by_applied");

    /// Transactions touching an address, keyed by
    /// `combine(address_prefix, applied_be ++ txid_prefix)`.
    pub const IDX_ADDRESS: TableDefinition<'static, &'static [u8], &'static [u8]> =
        TableDefinition::new("idx_tx_by_address");
}

/// Meta table row holding the partition format version, little-endian u32.
pub const META_FORMAT_VERSION: &str = "format_version";

/// Meta table row holding the lowest stored block height, little-endian u64.
pub const META_MIN_BLOCK: &str = "min_block";

/// Meta table row holding the highest stored block height, little-endian u64.
pub const META_MAX_BLOCK: &str = "max_block";

/// Current partition format version.
pub const FORMAT_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use redb::TableHandle;

    use super::*;

    #[test]
    fn test_table_names_are_unique() {
        let names = [
            Tables::BLOCKS.name(),
            Tables::TRANSACTIONS.name(),
            Tables::META.name(),
            Tables::IDX_BLOCKS.name(),
            Tables::IDX_TX_APPLIED.name(),
            Tables::IDX_ADDRESS.name(),
        ];
        for (i, a) in names.iter().enumerate() {
            for b in names.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
