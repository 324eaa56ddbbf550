//! # comprehensive storage tests
//!
//! why: verify all storage scenarios work correctly
//! relations: tests raft-storage crate
//! what: persistence, crash recovery, torn writes, node restarts, edge cases

use std::fs::{self, OpenOptions};
use std::io::{self, Write};

use raft_core::{LogEntry, MemoryStateMachine, RaftConfig, RaftNode, VoteRequest};
use raft_storage::{FileStorage, InMemoryStorage, Storage};
use tempfile::tempdir;

// =============================================================================
// SECTION 1: IN-MEMORY STORAGE TESTS
// =============================================================================

mod in_memory_basic {
    use super::*;

    #[test]
    fn new_storage_has_default_values() {
        let storage = InMemoryStorage::new();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        
        assert_eq!(term, 0);
        assert_eq!(voted_for, None);
    }

    #[test]
    fn save_and_load_term_and_vote() {
        let mut storage = InMemoryStorage::new();
        
        storage.save_term_and_vote(5, Some(3)).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        
        assert_eq!(term, 5);
        assert_eq!(voted_for, Some(3));
    }

    #[test]
    fn save_voted_for_none() {
        let mut storage = InMemoryStorage::new();
        
        storage.save_term_and_vote(10, None).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        
        assert_eq!(term, 10);
        assert_eq!(voted_for, None);
    }

    #[test]
    fn overwrite_term_and_vote() {
        let mut storage = InMemoryStorage::new();
        
        storage.save_term_and_vote(1, Some(1)).unwrap();
        storage.save_term_and_vote(5, Some(3)).unwrap();
        
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        assert_eq!(term, 5);
        assert_eq!(voted_for, Some(3));
    }
}

mod in_memory_log {
    use super::*;

    #[test]
    fn new_storage_has_empty_log() {
        let storage = InMemoryStorage::new();
        let log = storage.load_log().unwrap();
        
        assert!(log.is_empty());
    }

    #[test]
    fn append_single_entry() {
        let mut storage = InMemoryStorage::new();
        let entries = vec![LogEntry::new(1, 1, b"cmd1".to_vec())];
        
        storage.append_entries(&entries).unwrap();
        let log = storage.load_log().unwrap();
        
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].term, 1);
        assert_eq!(log[0].index, 1);
        assert_eq!(log[0].command, b"cmd1".to_vec());
    }

    #[test]
    fn append_multiple_entries() {
        let mut storage = InMemoryStorage::new();
        let entries = vec![
            LogEntry::new(1, 1, b"cmd1".to_vec()),
            LogEntry::new(1, 2, b"cmd2".to_vec()),
            LogEntry::new(2, 3, b"cmd3".to_vec()),
        ];
        
        storage.append_entries(&entries).unwrap();
        let log = storage.load_log().unwrap();
        
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn append_in_batches() {
        let mut storage = InMemoryStorage::new();
        
        storage.append_entries(&[LogEntry::new(1, 1, b"a".to_vec())]).unwrap();
        storage.append_entries(&[LogEntry::new(1, 2, b"b".to_vec())]).unwrap();
        storage.append_entries(&[LogEntry::new(1, 3, b"c".to_vec())]).unwrap();
        
        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn append_empty_entries() {
        let mut storage = InMemoryStorage::new();
        
        storage.append_entries(&[]).unwrap();
        
        let log = storage.load_log().unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn truncate_log_from_index() {
        let mut storage = InMemoryStorage::new();
        let entries = vec![
            LogEntry::new(1, 1, b"a".to_vec()),
            LogEntry::new(1, 2, b"b".to_vec()),
            LogEntry::new(1, 3, b"c".to_vec()),
            LogEntry::new(1, 4, b"d".to_vec()),
        ];
        storage.append_entries(&entries).unwrap();
        
        storage.truncate_log_from(3).unwrap();
        
        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].index, 1);
        assert_eq!(log[1].index, 2);
    }

    #[test]
    fn truncate_all_entries() {
        let mut storage = InMemoryStorage::new();
        let entries = vec![LogEntry::new(1, 1, b"a".to_vec())];
        storage.append_entries(&entries).unwrap();
        
        storage.truncate_log_from(1).unwrap();
        
        let log = storage.load_log().unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn truncate_empty_log() {
        let mut storage = InMemoryStorage::new();
        
        storage.truncate_log_from(5).unwrap();
        
        let log = storage.load_log().unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn clear_resets_all_state() {
        let mut storage = InMemoryStorage::new();
        storage.save_term_and_vote(10, Some(5)).unwrap();
        storage.append_entries(&[LogEntry::new(1, 1, b"cmd".to_vec())]).unwrap();
        
        storage.clear().unwrap();
        
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        let log = storage.load_log().unwrap();
        
        assert_eq!(term, 0);
        assert_eq!(voted_for, None);
        assert!(log.is_empty());
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE TESTS
// =============================================================================

mod file_storage_basic {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft_data");
        
        FileStorage::new(&path).unwrap();
        
        assert!(path.exists());
    }

    #[test]
    fn new_storage_has_default_values() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        
        assert_eq!(term, 0);
        assert_eq!(voted_for, None);
    }

    #[test]
    fn save_and_load_term_and_vote() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        storage.save_term_and_vote(7, Some(3)).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        
        assert_eq!(term, 7);
        assert_eq!(voted_for, Some(3));
    }

    #[test]
    fn save_creates_meta_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        storage.save_term_and_vote(5, Some(2)).unwrap();
        
        assert!(dir.path().join("meta.json").exists());
    }
}

mod file_storage_log {
    use super::*;

    #[test]
    fn append_creates_log_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        let entries = vec![LogEntry::new(1, 1, b"cmd".to_vec())];
        storage.append_entries(&entries).unwrap();
        
        assert!(dir.path().join("log.jsonl").exists());
    }

    #[test]
    fn append_and_load_entries() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        let entries = vec![
            LogEntry::new(1, 1, b"SET key1 value1".to_vec()),
            LogEntry::new(1, 2, b"SET key2 value2".to_vec()),
        ];
        storage.append_entries(&entries).unwrap();
        
        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].command, b"SET key1 value1".to_vec());
    }

    #[test]
    fn truncate_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        let entries = vec![
            LogEntry::new(1, 1, vec![1]),
            LogEntry::new(2, 2, vec![2]),
            LogEntry::new(3, 3, vec![3]),
        ];
        storage.append_entries(&entries).unwrap();
        
        storage.truncate_log_from(2).unwrap();
        
        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].index, 1);
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn term_survives_restart() {
        let dir = tempdir().unwrap();
        
        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(10, Some(5)).unwrap();
        }
        
        // "restart" - new storage instance
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let (term, voted_for) = storage.load_term_and_vote().unwrap();
            
            assert_eq!(term, 10);
            assert_eq!(voted_for, Some(5));
        }
    }

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();
        
        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let entries = vec![
                LogEntry::new(1, 1, b"cmd1".to_vec()),
                LogEntry::new(1, 2, b"cmd2".to_vec()),
            ];
            storage.append_entries(&entries).unwrap();
        }
        
        // "restart"
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let log = storage.load_log().unwrap();
            
            assert_eq!(log.len(), 2);
            assert_eq!(log[0].command, b"cmd1".to_vec());
            assert_eq!(log[1].command, b"cmd2".to_vec());
        }
    }

    #[test]
    fn multiple_restarts_preserve_state() {
        let dir = tempdir().unwrap();
        
        // session 1
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(1, Some(1)).unwrap();
            storage.append_entries(&[LogEntry::new(1, 1, b"a".to_vec())]).unwrap();
        }
        
        // session 2
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(2, Some(2)).unwrap();
            storage.append_entries(&[LogEntry::new(2, 2, b"b".to_vec())]).unwrap();
        }
        
        // session 3 - verify
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let (term, voted_for) = storage.load_term_and_vote().unwrap();
            let log = storage.load_log().unwrap();
            
            assert_eq!(term, 2);
            assert_eq!(voted_for, Some(2));
            assert_eq!(log.len(), 2);
        }
    }

    #[test]
    fn clear_removes_all_state() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        storage.save_term_and_vote(5, Some(3)).unwrap();
        storage.append_entries(&[LogEntry::new(1, 1, b"cmd".to_vec())]).unwrap();
        
        storage.clear().unwrap();
        
        assert!(!dir.path().join("meta.json").exists());
        assert_eq!(fs::metadata(dir.path().join("log.jsonl")).unwrap().len(), 0);
    }

    #[test]
    fn load_after_clear_returns_defaults() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        storage.save_term_and_vote(5, Some(3)).unwrap();
        storage.append_entries(&[LogEntry::new(1, 1, b"cmd".to_vec())]).unwrap();
        storage.clear().unwrap();
        
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        let log = storage.load_log().unwrap();
        
        assert_eq!(term, 0);
        assert_eq!(voted_for, None);
        assert!(log.is_empty());
    }
}

// =============================================================================
// SECTION 4: ATOMIC WRITE TESTS
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn meta_file_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        storage.save_term_and_vote(5, Some(2)).unwrap();
        
        let contents = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        let _: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
    }

    #[test]
    fn every_log_line_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        storage.append_entries(&[LogEntry::new(1, 1, b"cmd".to_vec())]).unwrap();
        storage.append_entries(&[LogEntry::new(1, 2, b"cmd".to_vec())]).unwrap();
        
        let contents = fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        assert!(contents.ends_with('\n'));
        for line in contents.lines() {
            let _: serde_json::Value = serde_json::from_str(line).expect("valid JSON");
        }
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        
        storage.save_term_and_vote(5, Some(2)).unwrap();
        storage.append_entries(&[LogEntry::new(1, 1, b"cmd".to_vec())]).unwrap();
        
        assert!(!dir.path().join("meta.tmp").exists());
    }
}

// =============================================================================
// SECTION 5: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn large_log_entry() {
        let mut storage = InMemoryStorage::new();
        
        // 1MB command
        let large_command = vec![0u8; 1024 * 1024];
        let entries = vec![LogEntry::new(1, 1, large_command.clone())];
        
        storage.append_entries(&entries).unwrap();
        let log = storage.load_log().unwrap();
        
        assert_eq!(log[0].command.len(), 1024 * 1024);
    }

    #[test]
    fn many_log_entries() {
        let mut storage = InMemoryStorage::new();
        
        let entries: Vec<LogEntry> = (1..=1000)
            .map(|i| LogEntry::new(1, i, format!("cmd{}", i).into_bytes()))
            .collect();
        
        storage.append_entries(&entries).unwrap();
        let log = storage.load_log().unwrap();
        
        assert_eq!(log.len(), 1000);
    }

    #[test]
    fn binary_command_data() {
        let mut storage = InMemoryStorage::new();
        
        let binary_data = vec![0x00, 0xFF, 0x7F, 0x80, 0xFE];
        let entries = vec![LogEntry::new(1, 1, binary_data.clone())];
        
        storage.append_entries(&entries).unwrap();
        let log = storage.load_log().unwrap();
        
        assert_eq!(log[0].command, binary_data);
    }

    #[test]
    fn unicode_in_command() {
        let mut storage = InMemoryStorage::new();
        
        let unicode_cmd = "SET 键 值 🎉".as_bytes().to_vec();
        let entries = vec![LogEntry::new(1, 1, unicode_cmd.clone())];
        
        storage.append_entries(&entries).unwrap();
        let log = storage.load_log().unwrap();
        
        assert_eq!(log[0].command, unicode_cmd);
    }

    #[test]
    fn very_high_term_number() {
        let mut storage = InMemoryStorage::new();
        
        storage.save_term_and_vote(u64::MAX, Some(u64::MAX)).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        
        assert_eq!(term, u64::MAX);
        assert_eq!(voted_for, Some(u64::MAX));
    }

    #[test]
    fn high_log_index() {
        let mut storage = InMemoryStorage::new();
        
        let entries = vec![LogEntry::new(1, u64::MAX, b"cmd".to_vec())];
        storage.append_entries(&entries).unwrap();
        
        let log = storage.load_log().unwrap();
        assert_eq!(log[0].index, u64::MAX);
    }
}

// =============================================================================
// SECTION 6: STORAGE TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn test_storage_impl<S: Storage>(storage: &mut S) {
        // save and load term
        storage.save_term_and_vote(5, Some(2)).unwrap();
        let (term, voted_for) = storage.load_term_and_vote().unwrap();
        assert_eq!(term, 5);
        assert_eq!(voted_for, Some(2));
        
        // append and load log
        let entries = vec![LogEntry::new(1, 1, b"cmd".to_vec())];
        storage.append_entries(&entries).unwrap();
        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 1);
        
        // truncate
        storage.truncate_log_from(1).unwrap();
        let log = storage.load_log().unwrap();
        assert!(log.is_empty());
        
        // clear
        storage.clear().unwrap();
        let (term, _) = storage.load_term_and_vote().unwrap();
        assert_eq!(term, 0);
    }

    #[test]
    fn in_memory_implements_trait() {
        let mut storage = InMemoryStorage::new();
        test_storage_impl(&mut storage);
    }

    #[test]
    fn file_storage_implements_trait() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        test_storage_impl(&mut storage);
    }
}

// =============================================================================
// SECTION 7: TORN WRITES AND CORRUPTION
// =============================================================================

mod torn_writes {
    use super::*;

    fn append_raw(dir: &std::path::Path, bytes: &[u8]) {
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.join("log.jsonl"))
            .unwrap();
        file.write_all(bytes).unwrap();
    }

    #[test]
    fn partial_final_record_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage
                .append_entries(&[
                    LogEntry::new(1, 1, b"a".to_vec()),
                    LogEntry::new(1, 2, b"b".to_vec()),
                ])
                .unwrap();
        }
        let intact_len = fs::metadata(dir.path().join("log.jsonl")).unwrap().len();
        append_raw(dir.path(), br#"{"term":1,"index":3,"comm"#);

        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.last_index(), 2);
        assert_eq!(storage.load_log().unwrap().len(), 2);
        assert_eq!(
            fs::metadata(dir.path().join("log.jsonl")).unwrap().len(),
            intact_len
        );
    }

    #[test]
    fn appends_continue_after_recovery() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.append_entries(&[LogEntry::new(1, 1, b"a".to_vec())]).unwrap();
        }
        append_raw(dir.path(), b"{\"te");

        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&[LogEntry::new(1, 2, b"b".to_vec())]).unwrap();

        let reopened = FileStorage::new(dir.path()).unwrap();
        let log = reopened.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].command, b"b".to_vec());
    }

    #[test]
    fn corrupt_record_before_the_tail_refuses_to_open() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.append_entries(&[LogEntry::new(1, 1, b"a".to_vec())]).unwrap();
        }
        append_raw(dir.path(), b"garbage\n");
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join("log.jsonl"))
                .unwrap();
            let entry = serde_json::to_string(&LogEntry::new(1, 3, b"c".to_vec())).unwrap();
            writeln!(file, "{entry}").unwrap();
        }

        let err = FileStorage::new(dir.path()).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn out_of_order_records_refuse_to_open() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        let mut contents = String::new();
        for index in [1u64, 3] {
            contents.push_str(&serde_json::to_string(&LogEntry::new(1, index, vec![])).unwrap());
            contents.push('\n');
        }
        fs::write(dir.path().join("log.jsonl"), contents).unwrap();

        let err = FileStorage::new(dir.path()).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("expected index 2"));
    }

    #[test]
    fn corrupt_meta_is_reported() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        fs::write(dir.path().join("meta.json"), b"not json").unwrap();

        let err = storage.load_term_and_vote().unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

// =============================================================================
// SECTION 8: NODE RESTARTS ON FILE STORAGE
// =============================================================================

mod node_restarts {
    use super::*;

    fn open_node(path: &std::path::Path) -> RaftNode<FileStorage> {
        let storage = FileStorage::new(path).unwrap();
        RaftNode::restore(
            2,
            vec![1, 2, 3],
            RaftConfig::default(),
            storage,
            MemoryStateMachine::new(),
        )
        .unwrap()
    }

    #[test]
    fn vote_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut node = open_node(dir.path());
            let request = VoteRequest {
                term: 4,
                candidate_id: 1,
                last_log_index: 0,
                last_log_term: 0,
            };
            let (response, _) = node.handle_vote_request(&request).unwrap();
            assert!(response.vote_granted);
        }

        let mut node = open_node(dir.path());
        assert_eq!(node.current_term(), 4);
        assert_eq!(node.voted_for(), Some(1));

        let rival = VoteRequest {
            term: 4,
            candidate_id: 3,
            last_log_index: 0,
            last_log_term: 0,
        };
        let (response, _) = node.handle_vote_request(&rival).unwrap();
        assert!(!response.vote_granted);
    }

    #[test]
    fn replicated_log_survives_restart_and_reapplies() {
        let dir = tempdir().unwrap();
        {
            let mut node = open_node(dir.path());
            let request = raft_core::AppendEntriesRequest {
                term: 1,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![
                    LogEntry::new(1, 1, b"x".to_vec()),
                    LogEntry::new(1, 2, b"y".to_vec()),
                ],
                leader_commit: 2,
            };
            node.handle_append_entries(&request).unwrap();
            assert_eq!(node.last_applied(), 2);
        }

        let mut node = open_node(dir.path());
        assert_eq!(node.log().len(), 2);
        assert_eq!(node.commit_index(), 0);
        assert!(node.state_machine().applied().is_empty());

        let heartbeat = raft_core::AppendEntriesRequest {
            term: 1,
            leader_id: 1,
            prev_log_index: 2,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 2,
        };
        node.handle_append_entries(&heartbeat).unwrap();
        assert_eq!(
            node.state_machine().commands(),
            vec![b"x".to_vec(), b"y".to_vec()]
        );
    }

    #[test]
    fn truncated_suffix_stays_truncated() {
        let dir = tempdir().unwrap();
        {
            let mut node = open_node(dir.path());
            let first = raft_core::AppendEntriesRequest {
                term: 1,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![
                    LogEntry::new(1, 1, b"a".to_vec()),
                    LogEntry::new(1, 2, b"stale".to_vec()),
                ],
                leader_commit: 0,
            };
            node.handle_append_entries(&first).unwrap();
            let repair = raft_core::AppendEntriesRequest {
                term: 2,
                leader_id: 3,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![LogEntry::new(2, 2, b"fresh".to_vec())],
                leader_commit: 0,
            };
            node.handle_append_entries(&repair).unwrap();
        }

        let node = open_node(dir.path());
        assert_eq!(node.current_term(), 2);
        assert_eq!(node.log().len(), 2);
        assert_eq!(node.get_entry(2).unwrap().command, b"fresh".to_vec());
    }
}
