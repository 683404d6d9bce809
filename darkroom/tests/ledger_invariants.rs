//! Property test: for all accounts, at all times,
//! `available = balance - held >= 0`, under random sequences of
//! grant/reserve/commit/cancel, including invalid transitions.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use darkroom::store::{InMemoryStore, ReservationStatus, Store, StoreError};
use darkroom::types::ReservationId;

fn assert_invariants(balance: Decimal, held: Decimal, context: &str) {
    assert!(held >= Decimal::ZERO, "held went negative ({context})");
    assert!(
        balance >= held,
        "available went negative: balance={balance} held={held} ({context})"
    );
}

#[tokio::test]
async fn random_op_sequences_never_break_the_ledger() {
    // Deterministic seed: failures reproduce
    let mut rng = StdRng::seed_from_u64(0x1ED9E7);
    let store = Arc::new(InMemoryStore::new());

    let mut accounts = Vec::new();
    for _ in 0..3 {
        let account = store
            .create_account(Decimal::from(rng.gen_range(0..50)))
            .await
            .unwrap();
        accounts.push(account.id);
    }

    let mut open_reservations: Vec<ReservationId> = Vec::new();
    let mut closed_reservations: Vec<ReservationId> = Vec::new();

    for step in 0..1000 {
        let account_id = accounts[rng.gen_range(0..accounts.len())];

        match rng.gen_range(0..5) {
            0 => {
                let amount = Decimal::from(rng.gen_range(1..20));
                store.grant(account_id, amount).await.unwrap();
            }
            1 => {
                let amount = Decimal::from(rng.gen_range(1..30));
                match store.reserve(account_id, amount, 1).await {
                    Ok((reservation, _)) => open_reservations.push(reservation.id),
                    Err(StoreError::InsufficientFunds {
                        requested,
                        available,
                    }) => {
                        assert!(available < requested, "spurious shortfall at step {step}");
                    }
                    Err(e) => panic!("unexpected reserve error at step {step}: {e}"),
                }
            }
            2 if !open_reservations.is_empty() => {
                let idx = rng.gen_range(0..open_reservations.len());
                let id = open_reservations.swap_remove(idx);
                store.commit_reservation(id).await.unwrap();
                closed_reservations.push(id);
            }
            3 if !open_reservations.is_empty() => {
                let idx = rng.gen_range(0..open_reservations.len());
                let id = open_reservations.swap_remove(idx);
                store.cancel_reservation(id).await.unwrap();
                closed_reservations.push(id);
            }
            4 if !closed_reservations.is_empty() => {
                // Replaying a terminal transition must fail loudly and
                // change nothing
                let id = closed_reservations[rng.gen_range(0..closed_reservations.len())];
                let account_before = {
                    let reservation = store.get_reservation(id).await.unwrap();
                    store.get_account(reservation.account_id).await.unwrap()
                };
                let result = if rng.gen_bool(0.5) {
                    store.commit_reservation(id).await
                } else {
                    store.cancel_reservation(id).await
                };
                assert!(matches!(
                    result,
                    Err(StoreError::InvalidReservationState { .. })
                ));
                let account_after = store.get_account(account_before.id).await.unwrap();
                assert_eq!(account_before.balance, account_after.balance);
                assert_eq!(account_before.held, account_after.held);
            }
            _ => {}
        }

        for id in &accounts {
            let account = store.get_account(*id).await.unwrap();
            assert_invariants(account.balance, account.held, &format!("step {step}"));
        }
    }

    // Held totals must equal the sum of still-open reservations
    for account_id in &accounts {
        let mut expected_held = Decimal::ZERO;
        for reservation_id in &open_reservations {
            let reservation = store.get_reservation(*reservation_id).await.unwrap();
            assert_eq!(reservation.status, ReservationStatus::Processing);
            if reservation.account_id == *account_id {
                expected_held += reservation.amount;
            }
        }
        let account = store.get_account(*account_id).await.unwrap();
        assert_eq!(
            account.held, expected_held,
            "held drifted from the open reservations"
        );
    }
}
