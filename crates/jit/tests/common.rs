use toccata_bpf::Insn;
use toccata_jit::{compile, compile_with_config, Config, Scratch};

pub fn run(prog: &[Insn], pkt: &[u8], wirelen: u32) -> u32 {
    let filter = compile(prog).expect("program should compile");
    let mut scratch = Scratch::new();
    filter.filter(pkt, wirelen, &mut scratch)
}

/// Compiled code and the reference interpreter must agree on every packet,
/// with and without check elision.
pub fn assert_equivalent(prog: &[Insn], packets: &[&[u8]]) {
    let elided = compile(prog).expect("program should compile");
    let checked = compile_with_config(
        prog,
        &Config {
            check_elision: false,
            ..Config::default()
        },
    )
    .expect("program should compile without elision");

    for pkt in packets {
        let wirelen = pkt.len() as u32;
        let expected = toccata_interpreter::filter(prog, pkt, wirelen);

        let mut scratch = Scratch::new();
        assert_eq!(
            elided.filter(pkt, wirelen, &mut scratch),
            expected,
            "compiled result diverges on {pkt:02x?}"
        );
        let mut scratch = Scratch::new();
        assert_eq!(
            checked.filter(pkt, wirelen, &mut scratch),
            expected,
            "unelided result diverges on {pkt:02x?}"
        );
    }
}

/// Like [`assert_equivalent`], over every prefix of `pkt`, so bounds
/// behavior gets exercised at each possible length.
pub fn assert_equivalent_prefixes(prog: &[Insn], pkt: &[u8]) {
    let prefixes: Vec<&[u8]> = (0..=pkt.len()).map(|n| &pkt[..n]).collect();
    assert_equivalent(prog, &prefixes);
}

/// A 54-byte Ethernet/IPv4/TCP frame with destination port 80.
pub fn tcp_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 54];
    frame[12] = 0x08; // ethertype: IPv4
    frame[13] = 0x00;
    frame[14] = 0x45; // version 4, header length 5 words
    frame[22] = 0x40; // ttl
    frame[23] = 0x06; // protocol: TCP
    frame[26..30].copy_from_slice(&[10, 0, 0, 1]); // source address
    frame[30..34].copy_from_slice(&[10, 0, 0, 2]); // destination address
    frame[34] = 0xd4; // source port 54321
    frame[35] = 0x31;
    frame[36] = 0x00; // destination port 80
    frame[37] = 0x50;
    frame
}

/// The classic "tcp dst port 80" filter over IPv4, as a code generator
/// would emit it: ethertype, protocol, fragment-offset and port tests,
/// with the header length picked up through Msh.
pub fn port80_filter() -> Vec<Insn> {
    use toccata_bpf::{JmpOp, Size};

    vec![
        Insn::ld_abs(Size::H, 12),
        Insn::jmp_k(JmpOp::Jeq, 0x0800, 0, 8),
        Insn::ld_abs(Size::B, 23),
        Insn::jmp_k(JmpOp::Jeq, 6, 0, 6),
        Insn::ld_abs(Size::H, 20),
        Insn::jmp_k(JmpOp::Jset, 0x1fff, 4, 0),
        Insn::ldx_msh(14),
        Insn::ld_ind(Size::H, 16),
        Insn::jmp_k(JmpOp::Jeq, 80, 0, 1),
        Insn::ret_k(65535),
        Insn::ret_k(0),
    ]
}
