mod common;

use anyhow::Result;
use common::{all_services, funded, register, test_service};
use pocketbook::application::{HistoryFilter, LedgerError};
use pocketbook::domain::{EntryKind, Provenance};

#[tokio::test]
async fn test_transfer_moves_money_and_tags_both_entries() -> Result<()> {
    for (service, _temp) in all_services().await? {
        let alice = funded(&service, "alice@example.com", 10000).await?;
        let bob = funded(&service, "bob@example.com", 500).await?;

        let receipt = service
            .transfer(alice.id, "bob@example.com", 10000)
            .await?;

        assert_eq!(service.balance(alice.id).await?, 0);
        assert_eq!(service.balance(bob.id).await?, 10500);

        assert_eq!(receipt.recipient_email, "bob@example.com");
        assert_eq!(receipt.message, "Transferred 100.00 to bob@example.com");

        assert_eq!(receipt.sent.user_id, alice.id);
        assert_eq!(receipt.sent.kind, EntryKind::Withdrawal);
        assert_eq!(receipt.sent.provenance, Provenance::TransferSent);
        assert_eq!(receipt.received.user_id, bob.id);
        assert_eq!(receipt.received.kind, EntryKind::Deposit);
        assert_eq!(receipt.received.provenance, Provenance::TransferReceived);

        assert!(receipt.sent.transfer_id.is_some());
        assert_eq!(receipt.sent.transfer_id, receipt.received.transfer_id);
        assert_eq!(receipt.sent.timestamp, receipt.received.timestamp);

        let alice_history = service.history(alice.id, &HistoryFilter::default()).await?;
        assert_eq!(alice_history[0], receipt.sent);
        let bob_history = service.history(bob.id, &HistoryFilter::default()).await?;
        assert_eq!(bob_history[0], receipt.received);
    }
    Ok(())
}

#[tokio::test]
async fn test_transfer_to_unknown_email() -> Result<()> {
    for (service, _temp) in all_services().await? {
        let alice = funded(&service, "alice@example.com", 1000).await?;

        let err = service
            .transfer(alice.id, "ghost@example.com", 100)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::RecipientNotFound(ref email) if email == "ghost@example.com"));
        assert!(err.is_not_found());

        assert_eq!(service.balance(alice.id).await?, 1000);
        let history = service.history(alice.id, &HistoryFilter::default()).await?;
        assert_eq!(history.len(), 1);
    }
    Ok(())
}

#[tokio::test]
async fn test_transfer_to_self_is_rejected() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = funded(&service, "alice@example.com", 1000).await?;

    let err = service
        .transfer(alice.id, "Alice@Example.com", 100)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::SelfTransfer));
    assert_eq!(service.balance(alice.id).await?, 1000);
    Ok(())
}

#[tokio::test]
async fn test_transfer_insufficient_funds_changes_nothing() -> Result<()> {
    for (service, _temp) in all_services().await? {
        let alice = funded(&service, "alice@example.com", 999).await?;
        let bob = register(&service, "bob@example.com").await?;

        let err = service
            .transfer(alice.id, "bob@example.com", 1000)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                balance: 999,
                required: 1000
            }
        ));

        assert_eq!(service.balance(alice.id).await?, 999);
        assert_eq!(service.balance(bob.id).await?, 0);
        assert!(
            service
                .history(bob.id, &HistoryFilter::default())
                .await?
                .is_empty()
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_transfer_rejects_non_positive_amount() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = funded(&service, "alice@example.com", 1000).await?;
    register(&service, "bob@example.com").await?;

    assert!(matches!(
        service.transfer(alice.id, "bob@example.com", 0).await,
        Err(LedgerError::Validation(_))
    ));
    assert!(matches!(
        service.transfer(alice.id, "bob@example.com", -10).await,
        Err(LedgerError::Validation(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_recipient_email_is_case_insensitive() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = funded(&service, "alice@example.com", 1000).await?;
    let bob = register(&service, "bob@example.com").await?;

    service
        .transfer(alice.id, "  BOB@Example.COM ", 250)
        .await?;
    assert_eq!(service.balance(bob.id).await?, 250);
    Ok(())
}

#[tokio::test]
async fn test_transfer_entries_cannot_be_edited_or_deleted() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = funded(&service, "alice@example.com", 1000).await?;
    let bob = register(&service, "bob@example.com").await?;

    let receipt = service.transfer(alice.id, "bob@example.com", 600).await?;

    assert!(matches!(
        service
            .edit(receipt.sent.id, alice.id, 100, Some("gift".into()))
            .await,
        Err(LedgerError::Validation(_))
    ));
    assert!(matches!(
        service.delete(receipt.received.id, bob.id).await,
        Err(LedgerError::Validation(_))
    ));

    assert_eq!(service.balance(alice.id).await?, 400);
    assert_eq!(service.balance(bob.id).await?, 600);
    Ok(())
}

#[tokio::test]
async fn test_received_money_can_be_spent() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = funded(&service, "alice@example.com", 5000).await?;
    let bob = register(&service, "bob@example.com").await?;

    service.transfer(alice.id, "bob@example.com", 3000).await?;
    service
        .withdraw(bob.id, 3000, Some("groceries".into()))
        .await?;
    service.transfer(alice.id, "bob@example.com", 2000).await?;

    assert_eq!(service.balance(alice.id).await?, 0);
    assert_eq!(service.balance(bob.id).await?, 2000);

    // Sent transfers are not spending
    let spending = service.spending_by_category(alice.id, None, None).await?;
    assert!(spending.is_empty());
    Ok(())
}
