mod common;

use anyhow::Result;
use common::{day, register, service_at};
use pocketbook::domain::Month;

#[tokio::test]
async fn test_monthly_summary_covers_current_month_only() -> Result<()> {
    let (service, clock, _temp) = service_at("2024-01-28").await?;
    let alice = register(&service, "alice@example.com").await?;
    register(&service, "bob@example.com").await?;

    // January activity
    service.deposit(alice.id, 50000).await?;
    service
        .withdraw(alice.id, 5000, Some("rent".into()))
        .await?;

    // February activity
    clock.set("2024-02-02");
    service.deposit(alice.id, 20000).await?;
    service
        .withdraw(alice.id, 1500, Some("food".into()))
        .await?;
    service.transfer(alice.id, "bob@example.com", 3500).await?;

    let summary = service.monthly_summary(alice.id).await?;
    assert_eq!(summary.period, Month::new(2024, 2).unwrap());
    assert_eq!(summary.inflows, 20000);
    assert_eq!(summary.outflows, 5000);
    assert_eq!(summary.net, 15000);

    let january = service
        .monthly_summary_for(alice.id, Month::new(2024, 1).unwrap())
        .await?;
    assert_eq!(january.inflows, 50000);
    assert_eq!(january.outflows, 5000);
    Ok(())
}

#[tokio::test]
async fn test_monthly_summary_empty_month() -> Result<()> {
    let (service, _clock, _temp) = service_at("2024-06-15").await?;
    let user = register(&service, "quiet@example.com").await?;

    let summary = service.monthly_summary(user.id).await?;
    assert_eq!(summary.inflows, 0);
    assert_eq!(summary.outflows, 0);
    assert_eq!(summary.net, 0);
    Ok(())
}

#[tokio::test]
async fn test_top_categories_ranks_current_month() -> Result<()> {
    let (service, clock, _temp) = service_at("2024-03-30").await?;
    let user = register(&service, "carol@example.com").await?;
    service.deposit(user.id, 100000).await?;

    // Last month's large spending does not count
    service
        .withdraw(user.id, 90000, Some("travel".into()))
        .await?;

    clock.set("2024-04-03");
    for (amount, category) in [
        (1200, "food"),
        (800, "food"),
        (3000, "rent"),
        (500, "books"),
        (2000, "utilities"),
    ] {
        service
            .withdraw(user.id, amount, Some(category.to_string()))
            .await?;
    }

    let top = service.top_categories(user.id, 3).await?;
    let names: Vec<&str> = top.iter().map(|t| t.category.as_str()).collect();
    // food (2000) ties utilities (2000); name breaks the tie
    assert_eq!(names, vec!["rent", "food", "utilities"]);
    assert_eq!(top[1].total, 2000);
    assert_eq!(top[1].count, 2);

    let all = service.top_categories(user.id, 10).await?;
    assert_eq!(all.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_spending_by_category_date_range() -> Result<()> {
    let (service, clock, _temp) = service_at("2024-05-01").await?;
    let user = register(&service, "dan@example.com").await?;
    service.deposit(user.id, 100000).await?;

    service
        .withdraw(user.id, 1000, Some("food".into()))
        .await?;
    clock.set("2024-05-10");
    service
        .withdraw(user.id, 2000, Some("food".into()))
        .await?;
    clock.set("2024-05-20");
    service
        .withdraw(user.id, 4000, Some("fuel".into()))
        .await?;

    let spending = service
        .spending_by_category(user.id, Some(day("2024-05-05")), Some(day("2024-05-20")))
        .await?;
    assert_eq!(spending.len(), 2);
    assert_eq!(spending[0].category, "fuel");
    assert_eq!(spending[0].total, 4000);
    assert_eq!(spending[1].category, "food");
    assert_eq!(spending[1].total, 2000);

    let open_start = service
        .spending_by_category(user.id, None, Some(day("2024-05-10")))
        .await?;
    assert_eq!(open_start.len(), 1);
    assert_eq!(open_start[0].total, 3000);
    assert_eq!(open_start[0].count, 2);
    Ok(())
}
