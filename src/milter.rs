// https://github.com/emersion/go-milter/blob/master/milter-protocol.txt

pub const SMFIF_VERSION: u32 = 6;

// protocol flags
pub const SMFIP_NOBODY: u32 = 0x00000010;
pub const SMFIP_NOHDRS: u32 = 0x00000020;
pub const SMFIP_NOEOH: u32 = 0x00000040;
pub const SMFIP_NR_HDR: u32 = 0x00000080;
pub const SMFIP_NOUNKNOWN: u32 = 0x00000100;
pub const SMFIP_NODATA: u32 = 0x00000200;
pub const SMFIP_NR_CONN: u32 = 0x00001000;
pub const SMFIP_NR_HELO: u32 = 0x00002000;

// commands from the MTA
pub const SMFIC_ABORT: char = 'A';
pub const SMFIC_CONNECT: char = 'C';
pub const SMFIC_MACRO: char = 'D';
pub const SMFIC_BODYEOB: char = 'E';
pub const SMFIC_HELO: char = 'H';
pub const SMFIC_QUIT_NC: char = 'K';
pub const SMFIC_MAIL: char = 'M';
pub const SMFIC_OPTNEG: char = 'O';
pub const SMFIC_QUIT: char = 'Q';
pub const SMFIC_RCPT: char = 'R';

// replies
pub const SMFIR_ACCEPT: u8 = b'a';
pub const SMFIR_CONTINUE: u8 = b'c';
pub const SMFIR_REPLYCODE: u8 = b'y';

/// Callbacks this filter wants; everything about the message content is
/// switched off.
pub const PROTOCOL: u32 = SMFIP_NR_CONN
    | SMFIP_NR_HELO
    | SMFIP_NR_HDR
    | SMFIP_NOHDRS
    | SMFIP_NOEOH
    | SMFIP_NOBODY
    | SMFIP_NOUNKNOWN
    | SMFIP_NODATA;

/// SMTP reply sent for a deferral.
pub fn tempfail_reply(message: &str) -> String {
    format!("451 4.7.1 {message}")
}
