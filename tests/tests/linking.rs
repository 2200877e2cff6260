//! Direct-branch and conditional linking properties, end to end.

use dbm_core::fragment::{BranchType, TB_CACHE_SIZE};
use dbm_core::thread::Arch;
use dbm_exec::{dispatch, lookup_or_scan};
use dbm_scanner::common::tb_read_key;
use dbm_tests::{
    make_thread, run_cond_edge, run_uncond_edge, t32_linked_dest, t32_program,
};

/// Two blocks joined by an unconditional branch: the dispatcher runs
/// exactly once over N traversals.
#[test]
fn direct_branch_dispatches_exactly_once() {
    let mut td = make_thread(Arch::Aarch32);

    // Block B: bx lr.
    let b_pc = t32_program(&[0x4770]);
    // Block A: b.w B, assembled in place.
    let a_pc = t32_program(&[0, 0, 0x4770]);
    {
        // SAFETY: patching the leaked program buffer.
        let mut w = unsafe { dbm_codec::CodeWriter::new(a_pc & !1) };
        let off = (b_pc & !1) as i64 - ((a_pc & !1) as i64 + 4);
        dbm_codec::t32::b32(&mut w, off as i32);
    }

    lookup_or_scan(&mut td, a_pc);
    let b_entry_expected = {
        let next = run_uncond_edge(&mut td, 0, b_pc);
        assert_eq!(td.stats.dispatch_calls, 1);
        next
    };

    for _ in 0..10 {
        let next = run_uncond_edge(&mut td, 0, b_pc);
        assert_eq!(next & !1, b_entry_expected & !1);
    }
    assert_eq!(td.stats.dispatch_calls, 1);

    // The exit is a direct branch to B's fragment.
    let exit = td.code_cache_meta[0].exit_branch_addr;
    assert_eq!(
        t32_linked_dest(exit),
        td.entry_address.lookup(b_pc).map(|a| a & !1)
    );
}

/// Hot loop: head and tail fragments, two dispatcher entries total,
/// every later iteration runs linked.
#[test]
fn hot_loop_dispatches_twice() {
    let mut td = make_thread(Arch::Aarch32);

    // subs r0, #1 ; bne -4 (back to the subs) ; bx lr
    let pc = t32_program(&[0x3801, 0xD1FD, 0x4770]);
    lookup_or_scan(&mut td, pc);
    let head = 0;
    let meta = td.code_cache_meta[head].clone();
    assert_eq!(meta.exit_branch_type, BranchType::CondImm);
    assert_eq!(meta.branch_taken_addr, pc);
    assert_eq!(meta.branch_skipped_addr, pc + 4);

    // Ten iterations: nine taken traversals, one fall-through.
    for _ in 0..9 {
        run_cond_edge(&mut td, head, true);
    }
    run_cond_edge(&mut td, head, false);

    assert_eq!(td.stats.dispatch_calls, 2);
    assert_eq!(td.code_cache_meta[head].branch_cache_status, 3);
}

/// Conditional linking is monotone: at most one dispatch per arm for
/// the lifetime of the fragment.
#[test]
fn conditional_status_reaches_three_and_stays() {
    let mut td = make_thread(Arch::Aarch32);
    // beq +0 -> taken at +4; fallthrough +2.
    let pc = t32_program(&[0xD000, 0x4770, 0x4770]);
    lookup_or_scan(&mut td, pc);

    for round in 0..4 {
        run_cond_edge(&mut td, 0, true);
        run_cond_edge(&mut td, 0, false);
        assert_eq!(td.code_cache_meta[0].branch_cache_status, 3, "round {round}");
    }
    assert_eq!(td.stats.dispatch_calls, 2);
}

/// Indirect branches resolve through the hash table; repeats make no
/// dispatcher entries once the target is cached.
#[test]
fn indirect_call_resolves_through_hash() {
    let mut td = make_thread(Arch::Aarch32);

    // Caller: blx r3 (indirect call), then unreachable padding.
    let caller = t32_program(&[0x4798, 0xBF00]);
    // Callee: bx lr.
    let callee = t32_program(&[0x4770]);

    lookup_or_scan(&mut td, caller);
    assert_eq!(
        td.code_cache_meta[0].exit_branch_type,
        BranchType::UncondReg
    );

    // First execution: the inline lookup misses and enters the
    // dispatcher once for the callee and once for the return.
    dispatch(&mut td, callee, 0);
    let ret_pc = caller + 2;
    let callee_frag = td.code_cache.index_of(
        td.entry_address.lookup(callee).unwrap() & !1,
    );
    dispatch(&mut td, ret_pc, callee_frag);
    assert!(td.stats.dispatch_calls <= 2);

    // Both targets are now in the table the emitted lookup probes.
    assert!(td.entry_address.lookup(callee).is_some());
    assert!(td.entry_address.lookup(ret_pc).is_some());
}

/// Table branch: the first TB_CACHE_SIZE distinct indices become
/// directly linked; later ones keep resolving without error.
#[test]
fn table_branch_links_first_indices_then_falls_back() {
    let mut td = make_thread(Arch::Aarch32);

    // tbb [pc, r1] followed by a byte table with TB_CACHE_SIZE + 1
    // entries, each landing on its own bx lr two bytes apart.
    let n = TB_CACHE_SIZE + 1;
    let mut prog: Vec<u16> = vec![0xE8DF, 0xF001];
    // Byte table: entry i -> (table_bytes + i*2 + 2) / 2 halfword
    // offset from PC (pc = tbb address + 4 = table start).
    let table_halfwords = (n + 1) / 2;
    let mut bytes = Vec::new();
    for i in 0..n {
        bytes.push((table_halfwords + i) as u8);
    }
    while bytes.len() % 2 != 0 {
        bytes.push(0);
    }
    for pair in bytes.chunks(2) {
        prog.push(u16::from_le_bytes([pair[0], pair[1]]));
    }
    for _ in 0..n {
        prog.push(0x4770); // bx lr
    }
    let pc = t32_program(&prog);
    let table_base = (pc & !1) + 4;

    lookup_or_scan(&mut td, pc);
    let meta = td.code_cache_meta[0].clone();
    assert_eq!(meta.exit_branch_type, BranchType::Tbb);

    // Drive each arm twice, simulating the emitted sequence: record
    // the observed index, then dispatch on a miss.
    for round in 0..2 {
        for i in 0..n {
            let entry = unsafe { ((table_base + i) as *const u8).read() } as usize;
            let target = (table_base - 4 + 4 + entry * 2) | 1;
            let linked = (0..TB_CACHE_SIZE)
                .any(|s| tb_read_key(meta.exit_branch_addr, s) == i as u32);
            if linked {
                assert!(
                    td.entry_address.lookup(target).is_some(),
                    "linked index {i} must be cached"
                );
                continue;
            }
            td.code_cache_meta[0].rn = i as u32;
            let next = dispatch(&mut td, target, 0);
            assert_eq!(next, td.entry_address.lookup(target).unwrap());
            let _ = round;
        }
    }

    // The pair table holds the first TB_CACHE_SIZE indices.
    for s in 0..TB_CACHE_SIZE {
        assert_eq!(tb_read_key(meta.exit_branch_addr, s), s as u32);
    }
    assert_eq!(td.code_cache_meta[0].free_b as usize, TB_CACHE_SIZE);
}

/// A64: BL sets the link register and links like any direct branch.
#[test]
fn a64_bl_links_once() {
    let mut td = make_thread(Arch::Aarch64);
    let callee = dbm_tests::a64_program(&[0xD65F_03C0]); // ret
    let mut caller_words = vec![0u32, 0xD65F_03C0];
    let caller_ptr = caller_words.as_mut_ptr() as usize;
    let off = ((callee as i64 - caller_ptr as i64) >> 2) as u32 & 0x03FF_FFFF;
    caller_words[0] = 0x9400_0000 | off;
    let caller = Box::leak(caller_words.into_boxed_slice()).as_ptr() as usize;

    lookup_or_scan(&mut td, caller);
    dispatch(&mut td, callee, 0);
    assert_eq!(td.stats.dispatch_calls, 1);

    // The exit decodes as a direct A64 branch to the callee fragment.
    let exit = td.code_cache_meta[0].exit_branch_addr;
    let word = td.code_cache.read_u32(exit);
    match dbm_codec::a64::decode_word(word) {
        dbm_codec::a64::A64Inst::B { offset } => {
            assert_eq!(
                (exit as i64 + offset as i64) as usize,
                td.entry_address.lookup(callee).unwrap()
            );
        }
        other => panic!("unlinked exit: {other:?}"),
    }
}
