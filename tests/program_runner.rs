mod common;

use common::{path, Faults, SimulatedServer};
use mvquery::error::MvQueryError;
use mvquery::record::ByteSource;

const SOURCE: &str = "$BASICTYPE \"U\"\nPRINT 'hello'\n";

#[test]
fn compile_run_remove_leaves_nothing_behind() {
    let server = SimulatedServer::orders(0);
    let runner = server.runner();
    runner.compile("BP", "HELLO", SOURCE).expect("compiles");
    assert!(server.files().contains(&path("BP/HELLO")));
    assert!(server.files().contains(&path("BP/_HELLO")));

    let mut output = runner.run("BP", "HELLO", &["-N"]).expect("runs");
    assert_eq!(output.read_to_string_lossy().expect("read"), "HELLO ran\n");
    output.close().expect("close");
    assert_eq!(server.commands(), vec!["BASIC BP HELLO".to_string(), "RUN BP HELLO -N".to_string()]);

    runner.remove("BP", "HELLO").expect("removed");
    assert!(server.files().is_empty(), "left: {:?}", server.files());
}

#[test]
fn compile_failure_carries_compiler_output() {
    let server = SimulatedServer::orders(0).with_faults(Faults { compile_error: Some("BAD"), ..Faults::default() });
    let runner = server.runner();
    let err = runner.compile("BP", "BADPROG", SOURCE).expect_err("fails");
    match err {
        MvQueryError::Compile { program, output } => {
            assert_eq!(program, "BP BADPROG");
            assert!(output.contains("syntax error"), "{output}");
        }
        other => panic!("expected compile error, got {other:?}"),
    }
    // the compiler output was still collected and deleted
    assert_eq!(server.files(), vec![path("BP/BADPROG")]);
}

#[test]
fn remove_attempts_both_paths() {
    let server = SimulatedServer::orders(0);
    let runner = server.runner();
    runner.compile("BP", "HALF", SOURCE).expect("compiles");
    let server = server.with_faults(Faults { fail_remove: Some("_HALF"), ..Faults::default() });
    let err = runner.remove("BP", "HALF").expect_err("object removal fails");
    assert!(matches!(err, MvQueryError::Transport(_)));
    assert_eq!(server.removed().last(), Some(&path("BP/HALF")), "source still removed");
}

#[test]
fn blank_names_are_rejected_before_any_remote_call() {
    let server = SimulatedServer::orders(0);
    let runner = server.runner();
    assert!(matches!(runner.compile("BP", " ", SOURCE), Err(MvQueryError::Usage(_))));
    assert!(matches!(runner.run("", "X", &[]), Err(MvQueryError::Usage(_))));
    assert!(matches!(runner.delete_saved_list(""), Err(MvQueryError::Usage(_))));
    assert!(server.lines().is_empty());
}

#[test]
fn deleting_an_unknown_saved_list_is_protocol_error() {
    let server = SimulatedServer::orders(0);
    let err = server.runner().delete_saved_list("it's gone").expect_err("not found");
    match err {
        MvQueryError::Protocol { output, .. } => assert_eq!(output, "'it's gone' not found.\n"),
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert_eq!(server.commands(), vec!["DELETELIST 'it':\"'\":'s gone'".to_string()]);
}
