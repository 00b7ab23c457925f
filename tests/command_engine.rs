//! Command engine integration tests: compilation, help, suggestions.

mod common;

use common::{daemon, run};

// =============================================================================
// COMPILATION
// =============================================================================

/// `echo hello world` produces exactly one clean response.
#[tokio::test]
async fn local_echo() {
    let (d, _dir) = daemon("n0").await;

    let responses = run(&d, "echo hello world").await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response, "hello world");
    assert!(responses[0].error.is_none());

    d.shutdown().await;
}

/// Compiling a command's own original text reproduces its pattern.
#[tokio::test]
async fn compile_idempotent_on_original() {
    let (d, _dir) = daemon("n0").await;

    for line in [
        "echo a b c",
        "vm info",
        "mesh send n[0-3] vm info",
        "read boot.mm check",
        "vm launch kvm a,b[0-1]",
    ] {
        let cmd = d.registry.compile(line).unwrap().unwrap();
        assert_eq!(cmd.original, line);
        let again = d.registry.compile(&cmd.original).unwrap().unwrap();
        assert_eq!(again.pattern, cmd.pattern, "pattern drifted for {:?}", line);
    }

    d.shutdown().await;
}

/// Blank and comment-only lines compile to nil.
#[tokio::test]
async fn blank_and_comment_lines_are_nil() {
    let (d, _dir) = daemon("n0").await;

    assert!(d.registry.compile("").unwrap().is_none());
    assert!(d.registry.compile("   \t ").unwrap().is_none());
    assert!(d.registry.compile("# vm launch kvm a").unwrap().is_none());

    d.shutdown().await;
}

/// Unknown words error; known words with wrong arity hint at the pattern.
#[tokio::test]
async fn unknown_and_invalid_commands() {
    let (d, _dir) = daemon("n0").await;

    let err = d.registry.compile("frobnicate the cluster").unwrap_err();
    assert_eq!(err.to_string(), "unknown command");

    let err = d.registry.compile("write").unwrap_err();
    assert!(err.to_string().starts_with("invalid command"));
    assert!(err.to_string().contains("write <file>"));

    d.shutdown().await;
}

/// A mesh send nested in a mesh send is refused at compile time.
#[tokio::test]
async fn compound_mesh_send_refused() {
    let (d, _dir) = daemon("n0").await;

    let err = d
        .registry
        .compile("mesh send n0 mesh send n1 echo hi")
        .unwrap_err();
    assert_eq!(err.to_string(), "compound mesh commands are not allowed");

    d.shutdown().await;
}

/// Arg maps contain exactly the names the pattern mentions.
#[tokio::test]
async fn arg_maps_match_pattern_names() {
    let (d, _dir) = daemon("n0").await;

    let cmd = d.registry.compile("vm start a").unwrap().unwrap();
    assert_eq!(cmd.string_args.len(), 1);
    assert_eq!(cmd.string("target"), Some("a"));
    assert!(cmd.has_bool("start"));
    assert!(!cmd.has_bool("stop"));
    assert!(cmd.list_args.is_empty());

    let cmd = d.registry.compile("mesh send n[0-1] vm info").unwrap().unwrap();
    assert_eq!(cmd.string("clients"), Some("n[0-1]"));
    let sub = cmd.subcommand.as_deref().unwrap();
    assert_eq!(sub.pattern, "vm info [args]...");

    d.shutdown().await;
}

// =============================================================================
// HELP AND SUGGESTIONS
// =============================================================================

/// `help echo` is stable and bare `help` lists every handler.
#[tokio::test]
async fn help_idempotence() {
    let (d, _dir) = daemon("n0").await;

    let first = run(&d, "help echo").await;
    let second = run(&d, "help echo").await;
    assert_eq!(first[0].response, second[0].response);

    let all = run(&d, "help").await;
    assert!(all[0]
        .response
        .lines()
        .any(|line| line.starts_with("echo")));
    assert!(all[0].response.lines().any(|line| line.starts_with("mesh")));

    let missing = run(&d, "help frobnicate").await;
    assert!(missing[0].error.is_some());

    d.shutdown().await;
}

/// Suggestions complete literals and alternation choices.
#[tokio::test]
async fn suggestions() {
    let (d, _dir) = daemon("n0").await;

    assert!(d.registry.suggest("ec").contains(&"echo".to_string()));
    let vm_ops = d.registry.suggest("vm ");
    for word in ["launch", "start", "stop", "kill", "flush", "info", "config"] {
        assert!(vm_ops.contains(&word.to_string()), "missing {}", word);
    }

    d.shutdown().await;
}
