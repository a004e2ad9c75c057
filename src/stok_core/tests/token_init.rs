//! End-to-end token lifecycle against a real filesystem layout: fresh
//! initialization, login, PIN change, master-key recovery and persistence
//! across process-view reopen.

use log::Level;
use stok_common::util::logger::Logger;
use stok_core::hierarchy;
use stok_core::token::{Error, Token, TokenConfig, TokenHooks};
use stok_core::xlock::LockConfig;
use stok_core::{OverflowPolicy, Role};

fn test_config(dir: &tempfile::TempDir, name: &str) -> TokenConfig {
    TokenConfig {
        name: name.to_string(),
        lock: LockConfig {
            root: dir.path().join("lock"),
            group: None,
        },
        data_root: dir.path().join("data"),
        overflow_policy: OverflowPolicy::Fail,
        hooks: TokenHooks::default(),
    }
}

#[test]
fn full_token_lifecycle() {
    Logger::init(Level::Debug);

    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, "tok01");

    let mut token = Token::new(cfg.clone());
    token.open().unwrap();
    assert!(!token.is_initialized());

    token
        .init_token_data("lifecycle token", "12345678", "userpin1")
        .unwrap();
    assert!(token.is_initialized());

    // Login with each role; a wrong PIN is rejected without saying why.
    token.login(Role::SecurityOfficer, "12345678").unwrap();
    token.login(Role::User, "userpin1").unwrap();
    assert!(matches!(
        token.login(Role::SecurityOfficer, "00000000").unwrap_err(),
        Error::Hierarchy(hierarchy::Error::LoginIncorrect)
    ));

    // Both roles recover the same master key.
    let via_so = token
        .unwrap_master_key(Role::SecurityOfficer, "12345678")
        .unwrap();
    let via_user = token.unwrap_master_key(Role::User, "userpin1").unwrap();
    assert!(via_so == via_user);

    // Change the SO PIN: old stops working, new works, master key is
    // unchanged.
    token
        .set_pin(Role::SecurityOfficer, "12345678", "abcdefgh")
        .unwrap();
    assert!(matches!(
        token.login(Role::SecurityOfficer, "12345678").unwrap_err(),
        Error::Hierarchy(hierarchy::Error::LoginIncorrect)
    ));
    token.login(Role::SecurityOfficer, "abcdefgh").unwrap();
    let after_change = token
        .unwrap_master_key(Role::SecurityOfficer, "abcdefgh")
        .unwrap();
    assert!(after_change == via_so);
    token.close();

    // A fresh process-view sees everything that was persisted.
    let mut token = Token::new(cfg);
    token.open().unwrap();
    token.login(Role::SecurityOfficer, "abcdefgh").unwrap();
    token.login(Role::User, "userpin1").unwrap();
    let reopened = token.unwrap_master_key(Role::User, "userpin1").unwrap();
    assert!(reopened == via_so);
    token.close();
}

#[test]
fn reinitialization_replaces_the_hierarchy() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, "tok02");

    let mut token = Token::new(cfg);
    token.open().unwrap();
    token
        .init_token_data("first", "12345678", "userpin1")
        .unwrap();
    let first = token.unwrap_master_key(Role::User, "userpin1").unwrap();

    token
        .init_token_data("second", "87654321", "userpin2")
        .unwrap();
    // Old PINs are gone and the master key was regenerated.
    assert!(matches!(
        token.login(Role::User, "userpin1").unwrap_err(),
        Error::Hierarchy(hierarchy::Error::LoginIncorrect)
    ));
    let second = token.unwrap_master_key(Role::User, "userpin2").unwrap();
    assert!(!(first == second));
    token.close();
}

#[test]
fn two_views_share_the_object_name_counter() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir, "tok03");

    let mut a = Token::new(cfg.clone());
    a.open().unwrap();
    a.init_token_data("shared", "12345678", "userpin1").unwrap();

    let mut b = Token::new(cfg);
    b.open().unwrap();

    // Allocations interleave without ever repeating a name.
    assert_eq!(&a.next_object_name().unwrap(), b"00000000");
    assert_eq!(&b.next_object_name().unwrap(), b"00000001");
    assert_eq!(&a.next_object_name().unwrap(), b"00000002");
    assert_eq!(&b.next_object_name().unwrap(), b"00000003");

    a.close();
    b.close();
}
