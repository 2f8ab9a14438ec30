use std::io::Read;

use anyhow::{bail, Context};
use clap::Parser;
use console::style;

use alljoyn_wire::protocol::{
    self, name_service, Buffer, DissectStatus, InfoColumn, TreeEmitter, TreeNode,
};

/// A tool for decoding captured AllJoyn traffic. Reads a hex dump of one
/// packet and prints the dissected tree.
///
/// Input is hex bytes separated by arbitrary whitespace; `#` starts a
/// comment through the end of the line. For example:
///
///     $ echo '6c 01 00 01  00000000 2a000000 00000000' | ajdump
///
/// decodes an empty method call with serial 42. Name-service packets
/// (port 9956) are selected with `--port 9956`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The port the packet was captured on: 9955 for the message
    /// protocol, 9956 for the name service.
    #[arg(long, default_value_t = protocol::MESSAGE_PORT)]
    port: u16,

    /// Wire length of the packet, when the capture is truncated.
    #[arg(long)]
    reported_len: Option<usize>,

    /// File with hex bytes. Reads stdin when absent or `-`.
    file: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let text = match args.file.as_deref() {
        None | Some("-") => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?
        }
    };

    let data = parse_hex(&text)?;
    let buf = match args.reported_len {
        Some(len) if len < data.len() => {
            bail!("--reported-len {} is shorter than the {} captured bytes", len, data.len())
        }
        Some(len) => Buffer::with_reported_len(&data, len),
        None => Buffer::new(&data),
    };

    let mut tree = TreeEmitter::new();
    let mut info = InfoColumn::new();

    let status = match args.port {
        protocol::MESSAGE_PORT => protocol::dissect_message(&buf, &mut tree, &mut info, false),
        protocol::NAME_SERVICE_PORT => {
            name_service::dissect_name_service(&buf, &mut tree, &mut info)
        }
        port => bail!("no AllJoyn protocol is registered on port {}", port),
    };

    match status {
        DissectStatus::NotOurs => {
            println!("{}", style("not AllJoyn traffic").red());
            return Ok(());
        }
        DissectStatus::NeedMore { resume_at } => {
            println!(
                "{}",
                style(format!("incomplete PDU; {} bytes consumed", resume_at)).yellow()
            );
        }
        DissectStatus::Consumed(n) => {
            println!("{}", style(format!("consumed {} bytes", n)).green());
        }
        DissectStatus::Drained => {
            println!("{}", style("corrupt packet; buffer drained").red());
        }
    }

    if !info.as_str().is_empty() {
        println!("{} {}", style("info:").bold(), info.as_str());
    }

    for node in tree.roots() {
        print_node(node, 0);
    }

    Ok(())
}

fn parse_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    let mut nibbles = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("");
        for c in line.chars() {
            if c.is_whitespace() {
                continue;
            }
            let digit = c
                .to_digit(16)
                .with_context(|| format!("bad hex digit {:?}", c))?;
            nibbles.push(digit as u8);
        }
    }

    if nibbles.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }

    Ok(nibbles.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}

fn print_node(node: &TreeNode<'_>, depth: usize) {
    let indent = "  ".repeat(depth);
    let range = style(format!("[{}..{}]", node.range.start, node.range.end)).dim();

    let mut line = format!("{}{:?} {}", indent, node.kind, range);
    if let Some(value) = &node.value {
        line.push_str(&format!(" = {}", value));
    }
    if !node.label.is_empty() {
        line.push_str(&format!(" {}", style(node.label.trim_start()).cyan()));
    }

    println!("{}", line);

    for child in &node.children {
        print_node(child, depth + 1);
    }
}
