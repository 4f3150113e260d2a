//! Access control: authentication levels, block-store signatures, friendliness of
//! propagated blocks, and the admin/link operations.

mod common;

use std::thread;
use std::time::Duration;

use common::cluster::{roster_of, spawn_conodes, wait_for_block};
use rand::rngs::OsRng;
use skipchain::messages::{
    AddFollow, CreateLinkPrivate, DelFollow, FollowPolicy, ListFollow, SettingAuthentication,
    StoreSkipBlock,
};
use skipchain::types::basic::{Address, SkipBlockID};
use skipchain::types::block::SkipBlock;
use skipchain::types::crypto_primitives::{Keypair, SigningKey};
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
fn authentication_level_one_requires_known_signer() {
    let nodes = spawn_conodes(2);

    // A shared chain teaches node 0 about node 1's identity.
    let shared = SkipBlock::genesis(
        roster_of(&nodes),
        2,
        2,
        VERIFICATION_STANDARD.to_vec(),
        Payload::empty(),
        None,
    );
    let shared = nodes[0]
        .service
        .store_skip_block(store(None, shared))
        .unwrap()
        .latest;
    wait_for_block(&nodes, &shared.hash);

    // Node 1 runs its own chain; node 0 follows it by asking node 1 directly.
    let own_chain = SkipBlock::genesis(
        Roster::new(vec![nodes[1].identity()]),
        1,
        1,
        VERIFICATION_NONE.to_vec(),
        Payload::empty(),
        None,
    );
    let own_chain = nodes[1]
        .service
        .store_skip_block(store(None, own_chain))
        .unwrap()
        .latest;
    nodes[0]
        .service
        .add_follow(AddFollow {
            skipchain_id: own_chain.skip_chain_id(),
            search_policy: FollowPolicy::Lookup,
            conode: nodes[1].identity().address.clone(),
            signature: Vec::new(),
        })
        .unwrap();

    nodes[0]
        .service
        .setting_authentication(SettingAuthentication {
            authentication: 1,
            signature: Vec::new(),
        })
        .unwrap();

    // Without a signature the store is refused.
    let genesis = SkipBlock::genesis(
        Roster::new(vec![nodes[0].identity()]),
        2,
        2,
        VERIFICATION_NONE.to_vec(),
        Payload::Bytes(b"locked down".to_vec()),
        None,
    );
    let err = nodes[0]
        .service
        .store_skip_block(store(None, genesis.clone()))
        .unwrap_err();
    assert_eq!(err.code(), 4103);

    // A garbage signature is refused too.
    let mut request = store(None, genesis.clone());
    request.signature = Some(vec![7u8; 12]);
    let err = nodes[0].service.store_skip_block(request).unwrap_err();
    assert_eq!(err.code(), 4103);

    // A signature by a member of a followed chain's roster is accepted.
    let signature = nodes[1]
        .keypair
        .sign(&genesis.calculate_hash().bytes());
    let mut request = store(None, genesis);
    request.signature = Some(signature.bytes().to_vec());
    let reply = nodes[0].service.store_skip_block(request).unwrap();
    assert_eq!(reply.latest.index, 0);
}

#[test]
fn unfriendly_propagation_is_ignored() {
    let nodes = spawn_conodes(2);

    // Phase 1, everybody at level 0: a shared chain lands on both conodes.
    let chain_1 = SkipBlock::genesis(
        roster_of(&nodes),
        2,
        2,
        VERIFICATION_STANDARD.to_vec(),
        Payload::empty(),
        None,
    );
    let chain_1 = nodes[0]
        .service
        .store_skip_block(store(None, chain_1))
        .unwrap()
        .latest;
    wait_for_block(&nodes, &chain_1.hash);

    // Node 1 locks down. A new chain propagated to it is not friendly: its id is
    // unknown, and node 1 follows nobody.
    nodes[1]
        .service
        .setting_authentication(SettingAuthentication {
            authentication: 1,
            signature: Vec::new(),
        })
        .unwrap();
    let chain_2 = SkipBlock::genesis(
        roster_of(&nodes),
        2,
        2,
        VERIFICATION_STANDARD.to_vec(),
        Payload::Bytes(b"unwelcome".to_vec()),
        None,
    );
    let chain_2 = nodes[0]
        .service
        .store_skip_block(store(None, chain_2))
        .unwrap()
        .latest;
    thread::sleep(Duration::from_millis(200));
    assert!(nodes[0].service.skipblock_store().contains(&chain_2.hash));
    assert!(!nodes[1].service.skipblock_store().contains(&chain_2.hash));

    // Following the first chain (whose roster contains node 0) makes further chains from
    // node 0 friendly again.
    nodes[1]
        .service
        .add_follow(AddFollow {
            skipchain_id: chain_1.skip_chain_id(),
            search_policy: FollowPolicy::Lookup,
            conode: nodes[0].identity().address.clone(),
            signature: Vec::new(),
        })
        .unwrap();
    let chain_3 = SkipBlock::genesis(
        roster_of(&nodes),
        2,
        2,
        VERIFICATION_STANDARD.to_vec(),
        Payload::Bytes(b"welcome".to_vec()),
        None,
    );
    let chain_3 = nodes[0]
        .service
        .store_skip_block(store(None, chain_3))
        .unwrap()
        .latest;
    wait_for_block(&nodes, &chain_3.hash);

    // And the followed chain keeps working end to end.
    let reply = nodes[0]
        .service
        .store_skip_block(store(
            Some(chain_3.hash),
            SkipBlock::proposal(roster_of(&nodes), Payload::empty()),
        ))
        .unwrap();
    assert_eq!(reply.latest.index, 1);
}

#[test]
fn link_and_follow_administration() {
    let nodes = spawn_conodes(1);
    let client = Keypair::new(SigningKey::generate(&mut OsRng));

    // Linking needs a signature by the conode's own key over the client's public key.
    let err = nodes[0]
        .service
        .create_link_private(CreateLinkPrivate {
            public: client.public_bytes(),
            signature: vec![0u8; 64],
        })
        .unwrap_err();
    assert_eq!(err.code(), 4103);
    let link_sig = nodes[0].keypair.sign(&client.public_bytes().bytes());
    nodes[0]
        .service
        .create_link_private(CreateLinkPrivate {
            public: client.public_bytes(),
            signature: link_sig.bytes().to_vec(),
        })
        .unwrap();

    // With a client linked, admin calls must be signed by it.
    let scid = SkipBlockID::new([0xaa; 32]);
    let mut follow_msg = scid.bytes().to_vec();
    follow_msg.push(0);
    let err = nodes[0]
        .service
        .add_follow(AddFollow {
            skipchain_id: scid,
            search_policy: FollowPolicy::Chain,
            conode: Address::new(""),
            signature: Vec::new(),
        })
        .unwrap_err();
    assert_eq!(err.code(), 4103);
    nodes[0]
        .service
        .add_follow(AddFollow {
            skipchain_id: scid,
            search_policy: FollowPolicy::Chain,
            conode: Address::new(""),
            signature: client.sign(&follow_msg).bytes().to_vec(),
        })
        .unwrap();

    let reply = nodes[0].service.list_follow(ListFollow {}).unwrap();
    assert_eq!(reply.follow_ids, vec![scid]);
    assert!(reply.follow.is_empty());

    // Deleting removes the id; deleting again reports it missing.
    nodes[0]
        .service
        .del_follow(DelFollow {
            skipchain_id: scid,
            signature: client.sign(&scid.bytes()).bytes().to_vec(),
        })
        .unwrap();
    let reply = nodes[0].service.list_follow(ListFollow {}).unwrap();
    assert!(reply.follow_ids.is_empty());
    let err = nodes[0]
        .service
        .del_follow(DelFollow {
            skipchain_id: scid,
            signature: client.sign(&scid.bytes()).bytes().to_vec(),
        })
        .unwrap_err();
    assert_eq!(err.code(), 4100);

    // Authentication levels: 2 is reserved, anything above is unknown, 1 is fine.
    for level in [2u8, 7u8] {
        let err = nodes[0]
            .service
            .setting_authentication(SettingAuthentication {
                authentication: level,
                signature: client.sign(&[level]).bytes().to_vec(),
            })
            .unwrap_err();
        assert_eq!(err.code(), 4103);
    }
    nodes[0]
        .service
        .setting_authentication(SettingAuthentication {
            authentication: 1,
            signature: client.sign(&[1]).bytes().to_vec(),
        })
        .unwrap();
}
