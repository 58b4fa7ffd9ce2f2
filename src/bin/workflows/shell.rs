use std::io::{self, BufRead, Write};

use anyhow::Result;
use fw_emulator::shell::{execute, parse_command, ShellCommand};
use fw_emulator::{kind_of, Config, Session};

const PROMPT: &str = "fw> ";

/// Read commands from stdin until EOF or `quit`.
pub(crate) fn shell(config: Config) -> Result<()> {
    let mut session = Session::new(config)?;
    println!("fw-emulator shell; type help for commands");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{}", PROMPT);
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            println!();
            break;
        };
        let command = match parse_command(&line?) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("[-] {}", e);
                continue;
            }
        };

        match command {
            ShellCommand::Quit => break,
            ShellCommand::Run => println!("Ctrl A + X to leave"),
            _ => {}
        }
        match execute(&mut session, command) {
            Ok(message) => println!("[+] {}", message),
            Err(e) => eprintln!("[-] {} error: {:#}", kind_of(&e), e),
        }
    }
    Ok(())
}
