//! Reading chains: update-chain walks with block fetch, lookups by id and index, chain
//! listing, and snapshot reload.

mod common;

use common::cluster::{roster_of, spawn_conodes, test_config, wait_for_block};
use common::mem_db::MemDB;
use skipchain::messages::{
    AddFollow, FollowPolicy, GetAllSkipchains, GetSingleBlock, GetSingleBlockByIndex,
    GetUpdateChain, StoreSkipBlock,
};
use skipchain::persistence::{SnapshotStore, SKIPBLOCKS_KEY};
use skipchain::service::Service;
use skipchain::types::basic::{Address, SkipBlockID};
use skipchain::types::block::SkipBlock;
use skipchain::types::payload::Payload;
use skipchain::types::roster::Roster;
use skipchain::verifiers::{VERIFICATION_NONE, VERIFICATION_STANDARD};

fn store(latest_id: Option<SkipBlockID>, new_block: SkipBlock) -> StoreSkipBlock {
    StoreSkipBlock {
        latest_id,
        new_block,
        signature: None,
    }
}

#[test]
fn update_chain_follows_roster_changes() {
    let nodes = spawn_conodes(3);

    // The chain starts on nodes 0 and 1 only. Maximum height 1 keeps every block at
    // height 1, so the update walk visits each block in turn.
    let genesis = SkipBlock::genesis(
        roster_of(&nodes[0..2]),
        2,
        1,
        VERIFICATION_STANDARD.to_vec(),
        Payload::empty(),
        None,
    );
    let genesis = nodes[0]
        .service
        .store_skip_block(store(None, genesis))
        .unwrap()
        .latest;
    wait_for_block(&nodes[0..2], &genesis.hash);

    // Node 2 joins for block 1 (it must follow the chain to accept the roster).
    nodes[2]
        .service
        .add_follow(AddFollow {
            skipchain_id: genesis.skip_chain_id(),
            search_policy: FollowPolicy::Chain,
            conode: Address::new(""),
            signature: Vec::new(),
        })
        .unwrap();
    let block_1 = nodes[0]
        .service
        .store_skip_block(store(
            Some(genesis.hash),
            SkipBlock::proposal(roster_of(&nodes), Payload::empty()),
        ))
        .unwrap()
        .latest;
    wait_for_block(&nodes, &block_1.hash);

    // Node 1 leaves for block 2.
    let roster_02 = Roster::new(vec![nodes[0].identity(), nodes[2].identity()]);
    let block_2 = nodes[0]
        .service
        .store_skip_block(store(
            Some(block_1.hash),
            SkipBlock::proposal(roster_02, Payload::empty()),
        ))
        .unwrap()
        .latest;
    // The propagation batch carries block 1's fresh forward link together with block 2,
    // so once block 2 arrived everywhere the walk below can pass block 1.
    wait_for_block(&nodes, &block_2.hash);

    // Node 1 is no longer responsible for block 2, so its walk re-fetches it from the
    // block's own roster.
    let reply = nodes[1]
        .service
        .get_update_chain(GetUpdateChain {
            latest_id: genesis.hash,
        })
        .unwrap();
    let hashes: Vec<SkipBlockID> = reply.update.iter().map(|sb| sb.hash).collect();
    assert_eq!(hashes, vec![genesis.hash, block_1.hash, block_2.hash]);

    // Every returned block carries verifiable forward links.
    for block in &reply.update {
        block.verify_forward_signatures().unwrap();
    }
}

#[test]
fn single_conode_chain_reads() {
    let nodes = spawn_conodes(1);
    let roster = roster_of(&nodes);
    let genesis = SkipBlock::genesis(
        roster.clone(),
        2,
        2,
        VERIFICATION_NONE.to_vec(),
        Payload::empty(),
        None,
    );
    let genesis = nodes[0]
        .service
        .store_skip_block(store(None, genesis))
        .unwrap()
        .latest;

    let mut latest = genesis.clone();
    for index in 1..=4u32 {
        latest = nodes[0]
            .service
            .store_skip_block(store(
                Some(latest.hash),
                SkipBlock::proposal(
                    roster.clone(),
                    Payload::Bytes(format!("block {}", index).into_bytes()),
                ),
            ))
            .unwrap()
            .latest;
        assert_eq!(latest.index, index);
    }

    // By id.
    let block = nodes[0]
        .service
        .get_single_block(GetSingleBlock { id: latest.hash })
        .unwrap();
    assert_eq!(block.index, 4);
    let err = nodes[0]
        .service
        .get_single_block(GetSingleBlock {
            id: SkipBlockID::new([0x13; 32]),
        })
        .unwrap_err();
    assert_eq!(err.code(), 4100);

    // By index, walking the level-0 links from the genesis.
    for index in 0..=4u32 {
        let block = nodes[0]
            .service
            .get_single_block_by_index(GetSingleBlockByIndex {
                genesis: genesis.hash,
                index,
            })
            .unwrap();
        assert_eq!(block.index, index);
    }
    let err = nodes[0]
        .service
        .get_single_block_by_index(GetSingleBlockByIndex {
            genesis: genesis.hash,
            index: 9,
        })
        .unwrap_err();
    assert_eq!(err.code(), 4100);

    // The update chain skips over low blocks via the higher links.
    let reply = nodes[0]
        .service
        .get_update_chain(GetUpdateChain {
            latest_id: genesis.hash,
        })
        .unwrap();
    assert_eq!(reply.update.first().unwrap().hash, genesis.hash);
    assert_eq!(reply.update.last().unwrap().index, 4);
    assert!(reply.update.len() <= 4);
}

#[test]
fn all_skipchains_lists_one_block_per_chain() {
    let nodes = spawn_conodes(1);
    let roster = roster_of(&nodes);

    let chain_1 = nodes[0]
        .service
        .store_skip_block(store(
            None,
            SkipBlock::genesis(
                roster.clone(),
                2,
                2,
                VERIFICATION_NONE.to_vec(),
                Payload::Bytes(b"first".to_vec()),
                None,
            ),
        ))
        .unwrap()
        .latest;
    nodes[0]
        .service
        .store_skip_block(store(
            Some(chain_1.hash),
            SkipBlock::proposal(roster.clone(), Payload::empty()),
        ))
        .unwrap();
    let chain_2 = nodes[0]
        .service
        .store_skip_block(store(
            None,
            SkipBlock::genesis(
                roster,
                2,
                2,
                VERIFICATION_NONE.to_vec(),
                Payload::Bytes(b"second".to_vec()),
                None,
            ),
        ))
        .unwrap()
        .latest;

    let reply = nodes[0]
        .service
        .get_all_skipchains(GetAllSkipchains {})
        .unwrap();
    assert_eq!(reply.skipchains.len(), 2);
    let chain_ids: Vec<SkipBlockID> = reply
        .skipchains
        .iter()
        .map(|sb| sb.skip_chain_id())
        .collect();
    assert!(chain_ids.contains(&chain_1.skip_chain_id()));
    assert!(chain_ids.contains(&chain_2.skip_chain_id()));
    // The first chain is reported through its highest known block.
    let first = reply
        .skipchains
        .iter()
        .find(|sb| sb.skip_chain_id() == chain_1.skip_chain_id())
        .unwrap();
    assert_eq!(first.index, 1);
}

#[test]
fn restart_loads_snapshot() {
    let nodes = spawn_conodes(1);
    let roster = roster_of(&nodes);
    let genesis = nodes[0]
        .service
        .store_skip_block(store(
            None,
            SkipBlock::genesis(
                roster.clone(),
                2,
                2,
                VERIFICATION_NONE.to_vec(),
                Payload::empty(),
                None,
            ),
        ))
        .unwrap()
        .latest;
    nodes[0]
        .service
        .store_skip_block(store(
            Some(genesis.hash),
            SkipBlock::proposal(roster, Payload::empty()),
        ))
        .unwrap();
    nodes[0].service.shutdown();

    // A fresh service over the same snapshot store sees the whole chain.
    let restarted = Service::start(
        nodes[0].keypair.clone(),
        nodes[0].identity().address.clone(),
        nodes[0].network.clone(),
        nodes[0].db.clone(),
        test_config(),
    )
    .unwrap();
    assert_eq!(restarted.skipblock_store().len(), 2);
    assert!(restarted.skipblock_store().contains(&genesis.hash));

    // A corrupt snapshot refuses to start.
    let mut broken = MemDB::new();
    broken.set(SKIPBLOCKS_KEY, &[0xba, 0xd1]);
    assert!(Service::start(
        nodes[0].keypair.clone(),
        Address::new("127.0.0.1:9999"),
        nodes[0].network.clone(),
        broken,
        test_config(),
    )
    .is_err());
}
