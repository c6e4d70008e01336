#[cfg(test)]
mod tests {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    /// Changing an opcode, mnemonic or CPU cost changes consensus costs;
    /// update this only together with a deliberate table change.
    const EXPECTED_OP_TABLE_HASH: u64 = 9065338771222749994;

    fn fnv1a64(mut h: u64, bytes: &[u8]) -> u64 {
        for b in bytes {
            h ^= *b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }

    macro_rules! hash_ops {
        (
            $( $(#[$doc:meta])* $name:ident = $code:literal, $mnemonic:literal, $cpu:literal ),* $(,)?
        ) => {{
            let mut h = FNV_OFFSET;
            $(
                h = fnv1a64(h, stringify!($name).as_bytes());
                h = fnv1a64(h, &[crate::virtual_machine::isa::Op::$name as u8]);
                h = fnv1a64(h, $mnemonic.as_bytes());
                h = fnv1a64(h, &($cpu as u64).to_le_bytes());
            )*
            h
        }};
    }

    fn current_op_table_hash() -> u64 {
        crate::for_each_op!(hash_ops)
    }

    #[test]
    #[ignore]
    fn print_op_table_hash() {
        println!("OP_TABLE_HASH={}", current_op_table_hash());
    }

    #[test]
    fn op_table_hash_unchanged() {
        assert_eq!(current_op_table_hash(), EXPECTED_OP_TABLE_HASH);
    }
}
