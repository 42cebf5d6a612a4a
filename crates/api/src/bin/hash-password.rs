//! Password hashing utility
//!
//! Generates Argon2id hashes for seeding operator accounts without putting a
//! plaintext password in the environment history.
//!
//! Usage:
//!   cargo run --bin hash-password
//!   cargo run --bin hash-password "MySecurePassword123!"

use std::env;
use std::io::{self, Write};

use pulsedesk_api::auth::{hash_password, validate_password_strength};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let password = if let Some(pwd) = env::args().nth(1) {
        pwd
    } else {
        // Reading from stdin keeps the password out of the process list
        print!("Enter password to hash: ");
        io::stdout().flush()?;

        let mut password = String::new();
        io::stdin().read_line(&mut password)?;
        password.trim().to_string()
    };

    if let Err(e) = validate_password_strength(&password) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let hash = hash_password(&password)?;

    println!("\n===========================================");
    println!("Argon2id hash (PHC string):");
    println!("{hash}");
    println!("===========================================");
    Ok(())
}
