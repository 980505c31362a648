//! Audit Lookup - read-side verification against the audit store
//!
//! Usage:
//!   audit_lookup locate <topic> <payload-hex> <approx-rfc3339>
//!   audit_lookup parent <topic> <child-id>
//!   audit_lookup rebuild <topic>
//!
//! Uses the same environment as `audit_runtime` (`AUDIT_DB_PATH`,
//! `AUDIT_CACHE_BACKEND`, `AUDIT_CACHE_PATH`, `AUDIT_SEARCH_MAX_PROBES`).

use audit_trail::audit_core::AuditTrail;
use audit_trail::pipeline::config::AuditConfig;
use chrono::{DateTime, Utc};
use dotenv::dotenv;

const USAGE: &str = "Usage:
  audit_lookup locate <topic> <payload-hex> <approx-rfc3339>
  audit_lookup parent <topic> <child-id>
  audit_lookup rebuild <topic>";

fn locate(trail: &AuditTrail, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let [topic, payload_hex, approx] = args else {
        return Err(USAGE.into());
    };

    let payload = hex::decode(payload_hex).map_err(|e| format!("Invalid payload hex: {}", e))?;
    let approx: DateTime<Utc> = DateTime::parse_from_rfc3339(approx)
        .map_err(|e| format!("Invalid timestamp '{}': {}", approx, e))?
        .with_timezone(&Utc);

    match trail.prove_inclusion(&payload, approx, topic)? {
        Some(inclusion) => {
            println!("✅ Found in storage tree {}", inclusion.key);
            println!("   ├─ Root: {}", inclusion.root);
            println!("   ├─ Leaf index: {}", inclusion.proof.leaf_index);
            println!("   └─ Proof length: {}", inclusion.proof.proof_hashes.len());
        }
        None => println!("❌ Not found in topic {} after {}", topic, approx),
    }
    Ok(())
}

fn parent(trail: &AuditTrail, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let [topic, child_id] = args else {
        return Err(USAGE.into());
    };

    match trail.find_parent(topic, child_id) {
        Ok(parent_id) => println!("✅ {} -> {}", child_id, parent_id),
        Err(e) if e.is_not_found() => println!("❌ {} has no level 2 parent yet", child_id),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn rebuild(trail: &AuditTrail, args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let [topic] = args else {
        return Err(USAGE.into());
    };

    let written = trail.rebuild_pool_index(topic)?;
    println!("✅ Pool index rebuilt for {} ({} entries)", topic, written);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        return Err(USAGE.into());
    };

    let config = AuditConfig::from_env()?;
    let trail = config.open_trail()?;

    match command.as_str() {
        "locate" => locate(&trail, rest),
        "parent" => parent(&trail, rest),
        "rebuild" => rebuild(&trail, rest),
        other => Err(format!("Unknown command '{}'\n{}", other, USAGE).into()),
    }
}
