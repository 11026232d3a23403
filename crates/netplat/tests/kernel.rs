//! Tests against the running kernel, each in a throwaway namespace.
//!
//! ```bash
//! sudo cargo test -p netplat --features integration --test kernel
//! ```

#[macro_use]
#[path = "common/mod.rs"]
mod common;

use common::TestNamespace;
use netplat::{
    Address, ApplyMode, FqCodelParams, KernelSupport, Link, OperationOutcome, PlatformObject,
    Qdisc, Result, Route, Status, TcAction, TcHandle, Tfilter,
};

#[tokio::test]
async fn test_initial_sync_sees_loopback() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("sync")?;
    let platform = ns.platform().await?;
    let lo = platform.link_by_name("lo").expect("loopback present");
    assert_eq!(lo.ifindex, 1);
    Ok(())
}

#[tokio::test]
async fn test_qdisc_and_filter_scenario() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("tc")?;
    let mut platform = ns.platform().await?;
    let support = platform.kernel_support().await?;
    if !support.contains(KernelSupport::TC) || !support.supports("matchall") {
        eprintln!("Skipping test: kernel lacks tc or matchall");
        return Ok(());
    }

    let outcome = platform
        .apply(Link::dummy("test0").up(true).into(), ApplyMode::Add)
        .await?;
    assert_eq!(outcome.status(), Status::Success);
    let ifindex = platform
        .link_by_name("test0")
        .map(|l| l.ifindex)
        .expect("test0 cached");

    let egress = TcHandle::new(0x8003, 0);
    let steps: Vec<PlatformObject> = vec![
        Qdisc::fq_codel(ifindex, egress, FqCodelParams::default()).into(),
        Qdisc::ingress(ifindex).into(),
        Tfilter::matchall(ifindex, egress, TcAction::simple("Egress")).into(),
        Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::simple("Ingress")).into(),
    ];
    for step in steps {
        let outcome = platform.apply(step, ApplyMode::Add).await?;
        assert_eq!(outcome.status(), Status::Success, "{:?}", outcome);
    }

    let mut parents: Vec<TcHandle> = platform
        .cache()
        .iter_by_interface(ifindex)
        .filter_map(|o| match o {
            PlatformObject::Tfilter(f) => Some(f.parent),
            _ => None,
        })
        .collect();
    parents.sort();
    let mut expected = vec![egress, TcHandle::INGRESS_QDISC];
    expected.sort();
    assert_eq!(parents, expected);

    let shown = ns.exec("tc", &["filter", "show", "dev", "test0", "ingress"])?;
    assert!(shown.contains("matchall"));
    Ok(())
}

#[tokio::test]
async fn test_address_and_route() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("addr")?;
    let mut platform = ns.platform().await?;
    platform
        .apply(Link::dummy("test0").up(true).into(), ApplyMode::Add)
        .await?;
    let ifindex = platform
        .link_by_name("test0")
        .map(|l| l.ifindex)
        .expect("test0 cached");

    let addr = Address::parse_cidr(ifindex, "192.0.2.1/24")?;
    platform.apply(addr.clone().into(), ApplyMode::Add).await?;
    let again = platform.apply(addr.into(), ApplyMode::Add).await?;
    assert!(matches!(again, OperationOutcome::Unchanged(_)));

    let route = Route::parse_prefix("198.51.100.0/24")?
        .dev(ifindex)
        .via("192.0.2.254".parse().expect("valid address"));
    let outcome = platform.apply(route.clone().into(), ApplyMode::Add).await?;
    assert!(matches!(outcome, OperationOutcome::Confirmed(_)));

    let outcome = platform.apply(route.clone().into(), ApplyMode::Delete).await?;
    assert_eq!(outcome, OperationOutcome::Deleted);
    let outcome = platform.apply(route.into(), ApplyMode::Delete).await?;
    assert_eq!(outcome.status(), Status::Success);
    Ok(())
}

#[tokio::test]
async fn test_external_link_is_noticed() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("ext")?;
    let mut platform = ns.platform().await?;
    ns.exec("ip", &["link", "add", "ext0", "type", "dummy"])?;

    for _ in 0..50 {
        platform.drain().await?;
        if platform.link_by_name("ext0").is_some() {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("ext0 never showed up in the cache");
}
