//! Sync engine behaviour against the fake kernel: idempotence, identity
//! collapsing, reconciliation, overruns, retries and confirmation timing.

use std::net::IpAddr;
use std::time::Duration;

use netplat::netlink::NlMsgType;
use netplat::testing::FakeKernel;
use netplat::{
    Address, ApplyMode, CacheChange, Error, KernelSupport, Link, LinkKind, ObjectKind,
    OperationOutcome, Platform, PlatformConfig, PlatformObject, Qdisc, Result, Route, Status,
    SubscriptionFilter, TcAction, TcHandle, Tfilter,
};

fn config() -> PlatformConfig {
    PlatformConfig::new().module_root("/nonexistent")
}

async fn platform_with(config: PlatformConfig) -> Result<(FakeKernel, Platform<FakeKernel>)> {
    let kernel = FakeKernel::new();
    let platform = Platform::with_io(kernel.clone(), config).await?;
    Ok((kernel, platform))
}

async fn platform() -> Result<(FakeKernel, Platform<FakeKernel>)> {
    platform_with(config()).await
}

async fn add_link(platform: &mut Platform<FakeKernel>, name: &str) -> Result<u32> {
    platform
        .apply(Link::dummy(name).up(true).into(), ApplyMode::Add)
        .await?;
    platform
        .link_by_name(name)
        .map(|l| l.ifindex)
        .ok_or_else(|| Error::NotFound(name.into()))
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_initial_sync_loads_kernel_state() -> Result<()> {
    let (_kernel, platform) = platform().await?;
    let lo = platform.link_by_name("lo").expect("loopback cached");
    assert_eq!(lo.ifindex, 1);
    assert_eq!(platform.cache().count(ObjectKind::Ip4Address), 1);
    assert_eq!(platform.cache().count(ObjectKind::Qdisc), 1);
    Ok(())
}

#[tokio::test]
async fn test_add_twice_sends_one_request() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let desired: PlatformObject = Link::dummy("test0").up(true).mtu(1400).into();

    let first = platform.apply(desired.clone(), ApplyMode::Add).await?;
    assert!(matches!(first, OperationOutcome::Confirmed(_)));
    let second = platform.apply(desired, ApplyMode::Add).await?;
    assert!(matches!(second, OperationOutcome::Unchanged(_)));

    assert_eq!(kernel.request_count(NlMsgType::RTM_NEWLINK), 1);
    assert_eq!(platform.cache().count(ObjectKind::Link), 2);
    Ok(())
}

#[tokio::test]
async fn test_change_link_in_place() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let ifindex = add_link(&mut platform, "test0").await?;

    let outcome = platform
        .apply(Link::dummy("test0").up(false).mtu(9000).into(), ApplyMode::Add)
        .await?;
    let Some(PlatformObject::Link(link)) = outcome.object() else {
        panic!("expected a confirmed link, got {:?}", outcome);
    };
    assert_eq!(link.ifindex, ifindex);
    assert!(!link.is_up());
    assert_eq!(link.mtu, Some(9000));

    let change = kernel.requests().pop().and_then(|r| r.object);
    assert!(matches!(change, Some(PlatformObject::Link(l)) if l.ifindex == ifindex));
    Ok(())
}

#[tokio::test]
async fn test_link_kind_mismatch_is_rejected() -> Result<()> {
    let (_kernel, mut platform) = platform().await?;
    add_link(&mut platform, "test0").await?;
    let err = platform
        .apply(Link::new("test0", LinkKind::Bridge).into(), ApplyMode::Add)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::AlreadyExists);
    Ok(())
}

#[tokio::test]
async fn test_delete_absent_object_succeeds() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let outcome = platform
        .apply(Link::dummy("ghost0").into(), ApplyMode::Delete)
        .await?;
    assert_eq!(outcome, OperationOutcome::AlreadyAbsent);
    assert_eq!(outcome.status(), Status::Success);
    assert_eq!(kernel.request_count(NlMsgType::RTM_DELLINK), 1);

    let addr = Address::parse_cidr(1, "198.51.100.7/32")?;
    let outcome = platform.apply(addr.into(), ApplyMode::Delete).await?;
    assert_eq!(outcome, OperationOutcome::AlreadyAbsent);
    Ok(())
}

#[tokio::test]
async fn test_delete_drops_stale_cache_entry() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    add_link(&mut platform, "test0").await?;
    kernel.silent(Link::dummy("test0").into(), ApplyMode::Delete)?;
    assert!(platform.link_by_name("test0").is_some());

    let outcome = platform
        .apply(Link::dummy("test0").into(), ApplyMode::Delete)
        .await?;
    assert_eq!(outcome, OperationOutcome::AlreadyAbsent);
    assert!(platform.link_by_name("test0").is_none());
    Ok(())
}

#[tokio::test]
async fn test_address_spellings_share_one_entry() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let ifindex = add_link(&mut platform, "test0").await?;

    let combined = Address::parse_cidr(ifindex, "192.0.2.1/24")?;
    let separate = Address::new(ifindex, ip("192.0.2.1"), 24)?;
    assert_eq!(
        PlatformObject::from(combined.clone()).identity_key(),
        PlatformObject::from(separate.clone()).identity_key()
    );

    platform.apply(combined.into(), ApplyMode::Add).await?;
    let outcome = platform.apply(separate.into(), ApplyMode::Add).await?;
    assert!(matches!(outcome, OperationOutcome::Unchanged(_)));
    assert_eq!(kernel.request_count(NlMsgType::RTM_NEWADDR), 1);
    assert_eq!(
        platform
            .cache()
            .iter_by_interface(ifindex)
            .filter(|o| o.kind() == ObjectKind::Ip4Address)
            .count(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_route_nexthop_change_replaces_entry() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let a = add_link(&mut platform, "a0").await?;
    let b = add_link(&mut platform, "b0").await?;
    platform
        .apply(Address::parse_cidr(a, "10.1.0.1/24")?.into(), ApplyMode::Add)
        .await?;
    platform
        .apply(Address::parse_cidr(b, "10.2.0.1/24")?.into(), ApplyMode::Add)
        .await?;

    let via_a = Route::parse_prefix("192.0.2.0/24")?
        .dev(a)
        .via(ip("10.1.0.254"))
        .metric(1024);
    let via_b = Route::parse_prefix("192.0.2.0/24")?
        .dev(b)
        .via(ip("10.2.0.254"))
        .metric(1024);
    assert!(PlatformObject::equivalent(
        &via_a.clone().into(),
        &via_b.clone().into()
    ));

    platform.apply(via_a.into(), ApplyMode::Add).await?;
    let outcome = platform.apply(via_b.into(), ApplyMode::Add).await?;
    let Some(PlatformObject::Route(route)) = outcome.object() else {
        panic!("expected a confirmed route, got {:?}", outcome);
    };
    assert_eq!(route.ifindex, b);
    assert_eq!(route.gateway, Some(ip("10.2.0.254")));
    assert_eq!(platform.cache().count(ObjectKind::Ip4Route), 1);
    assert_eq!(kernel.objects(ObjectKind::Ip4Route).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_ipv6_route_identity_ignores_gateway() -> Result<()> {
    let (_kernel, mut platform) = platform().await?;
    let ifindex = add_link(&mut platform, "test0").await?;
    platform
        .apply(
            Address::parse_cidr(ifindex, "2001:db8::1/64")?.into(),
            ApplyMode::Add,
        )
        .await?;

    for gw in ["2001:db8::fe", "2001:db8::fd"] {
        let route = Route::parse_prefix("2001:db8:a:b::/64")?
            .dev(ifindex)
            .via(ip(gw));
        platform.apply(route.into(), ApplyMode::Add).await?;
    }
    let routes: Vec<_> = platform.cache().iter(ObjectKind::Ip6Route).collect();
    assert_eq!(routes.len(), 1);
    assert!(matches!(routes[0], PlatformObject::Route(r)
        if r.gateway == Some(ip("2001:db8::fd")) && r.metric == 1024));
    Ok(())
}

#[tokio::test]
async fn test_external_changes_reach_subscribers() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let mut links = platform.subscribe(SubscriptionFilter::Kind(ObjectKind::Link));

    kernel.external(Link::dummy("ext0").up(true).into(), ApplyMode::Add)?;
    platform.drain().await?;
    let ifindex = platform.link_by_name("ext0").map(|l| l.ifindex);
    assert!(ifindex.is_some());

    let events = links.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].change, CacheChange::Added);

    kernel.external(Link::dummy("ext0").into(), ApplyMode::Delete)?;
    platform.drain().await?;
    assert!(platform.link_by_name("ext0").is_none());
    let events = links.drain();
    assert!(matches!(events.as_slice(), [e] if e.change == CacheChange::Removed));
    Ok(())
}

#[tokio::test]
async fn test_full_resync_matches_kernel() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    add_link(&mut platform, "keep0").await?;
    add_link(&mut platform, "gone0").await?;

    kernel.silent(Link::dummy("gone0").into(), ApplyMode::Delete)?;
    kernel.silent(Link::dummy("new0").into(), ApplyMode::Add)?;
    kernel.silent(Link::dummy("keep0").mtu(1280).into(), ApplyMode::Add)?;

    let summary = platform.sync_kind(ObjectKind::Link).await?;
    assert_eq!(summary.added, 1);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.updated, 1);

    let mut cached: Vec<_> = platform
        .cache()
        .iter(ObjectKind::Link)
        .filter_map(|o| match o {
            PlatformObject::Link(l) => Some(l.name.clone()),
            _ => None,
        })
        .collect();
    cached.sort();
    assert_eq!(cached, ["keep0", "lo", "new0"]);
    assert_eq!(platform.link_by_name("keep0").and_then(|l| l.mtu), Some(1280));
    Ok(())
}

#[tokio::test]
async fn test_overrun_triggers_resync() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    kernel.silent(Link::dummy("quiet0").into(), ApplyMode::Add)?;
    kernel.overrun();

    platform.drain().await?;
    assert!(platform.link_by_name("quiet0").is_some());
    Ok(())
}

#[tokio::test]
async fn test_interrupted_dump_is_retried() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    kernel.clear_requests();
    kernel.interrupt_dumps(1);

    platform.sync_kind(ObjectKind::Link).await?;
    assert_eq!(kernel.request_count(NlMsgType::RTM_GETLINK), 2);
    Ok(())
}

#[tokio::test]
async fn test_operations_in_flight_together() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    kernel.set_dump_chunk(1);
    let first = platform
        .submit(Link::dummy("one0").into(), ApplyMode::Add)
        .await?;
    let second = platform
        .submit(Link::dummy("two0").into(), ApplyMode::Add)
        .await?;
    assert_eq!(platform.pending_ops(), 2);

    platform.settle().await?;
    assert_eq!(platform.pending_ops(), 0);
    assert!(matches!(
        platform.wait(first).await?,
        OperationOutcome::Confirmed(_)
    ));
    assert!(matches!(
        platform.wait(second).await?,
        OperationOutcome::Confirmed(_)
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_is_retried() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    kernel.fail_next(NlMsgType::RTM_NEWLINK, libc::EBUSY);

    let outcome = platform
        .apply(Link::dummy("test0").into(), ApplyMode::Add)
        .await?;
    assert!(matches!(outcome, OperationOutcome::Confirmed(_)));
    assert_eq!(kernel.request_count(NlMsgType::RTM_NEWLINK), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_gives_up_after_retries() -> Result<()> {
    let (kernel, mut platform) = platform_with(config().max_retries(2)).await?;
    for _ in 0..3 {
        kernel.fail_next(NlMsgType::RTM_NEWLINK, libc::EAGAIN);
    }

    let err = platform
        .apply(Link::dummy("test0").into(), ApplyMode::Add)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), Some(libc::EAGAIN));
    assert_eq!(kernel.request_count(NlMsgType::RTM_NEWLINK), 3);
    Ok(())
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    kernel.fail_next(NlMsgType::RTM_NEWLINK, libc::EPERM);

    let err = platform
        .apply(Link::dummy("test0").into(), ApplyMode::Add)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::KernelError(libc::EPERM));
    assert_eq!(kernel.request_count(NlMsgType::RTM_NEWLINK), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_notification_leaves_operation_unconfirmed() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    kernel.suppress_notifications(true);

    let outcome = platform
        .apply(Link::dummy("test0").into(), ApplyMode::Add)
        .await?;
    assert_eq!(outcome, OperationOutcome::Unconfirmed);
    assert_eq!(outcome.status(), Status::Timeout);
    // Not rolled back.
    assert!(kernel.link_index("test0").is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_ack_times_out() -> Result<()> {
    let (kernel, mut platform) =
        platform_with(config().ack_timeout(Duration::from_secs(1))).await?;
    kernel.drop_replies(true);

    let err = platform
        .apply(Link::dummy("test0").into(), ApplyMode::Add)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::Timeout);
    assert_eq!(platform.pending_ops(), 0);
    Ok(())
}

#[tokio::test]
async fn test_operation_abandoned_when_interface_goes_away() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let ifindex = add_link(&mut platform, "test0").await?;

    kernel.drop_replies(true);
    let handle = platform
        .submit(
            Address::parse_cidr(ifindex, "192.0.2.1/24")?.into(),
            ApplyMode::Add,
        )
        .await?;
    kernel.drop_replies(false);
    kernel.external(Link::dummy("test0").into(), ApplyMode::Delete)?;

    let outcome = platform.wait(handle).await?;
    assert_eq!(outcome, OperationOutcome::Abandoned);
    assert_eq!(outcome.status(), Status::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_link_kind_is_gated() -> Result<()> {
    let support = KernelSupport::all().without(KernelSupport::LINK_WIREGUARD);
    let (kernel, mut platform) = platform_with(config().kernel_support(support)).await?;
    kernel.clear_requests();

    let err = platform
        .apply(Link::new("wg0", LinkKind::Wireguard).into(), ApplyMode::Add)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::NotSupported);
    assert!(kernel.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_ipv6_disabled_kernel() -> Result<()> {
    let kernel = FakeKernel::new();
    kernel.disable_ipv6();
    let mut platform = Platform::with_io(kernel.clone(), config()).await?;

    let support = platform.kernel_support().await?;
    assert!(!support.contains(KernelSupport::IPV6));
    assert!(support.contains(KernelSupport::TC));

    let err = platform
        .apply(
            Address::parse_cidr(1, "2001:db8::1/64")?.into(),
            ApplyMode::Add,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::NotSupported);
    Ok(())
}

#[tokio::test]
async fn test_echo_requests_carry_flag() -> Result<()> {
    let (kernel, mut platform) = platform_with(config().echo(true)).await?;
    platform
        .apply(Link::dummy("test0").into(), ApplyMode::Add)
        .await?;
    let request = kernel
        .requests()
        .into_iter()
        .find(|r| r.msg_type == NlMsgType::RTM_NEWLINK)
        .expect("link request sent");
    assert_ne!(request.flags & netplat::netlink::message::NLM_F_ECHO, 0);
    Ok(())
}

async fn add_ingress(platform: &mut Platform<FakeKernel>) -> Result<u32> {
    let ifindex = add_link(platform, "test0").await?;
    platform
        .apply(Qdisc::ingress(ifindex).into(), ApplyMode::Add)
        .await?;
    Ok(ifindex)
}

fn cached_filters(platform: &Platform<FakeKernel>) -> Vec<Tfilter> {
    platform
        .cache()
        .iter(ObjectKind::Tfilter)
        .filter_map(|o| match o {
            PlatformObject::Tfilter(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_filters_sharing_a_parent_are_all_mirrored() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let ifindex = add_ingress(&mut platform).await?;
    platform
        .apply(
            Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::pass()).into(),
            ApplyMode::Add,
        )
        .await?;
    kernel.external(
        Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::drop()).into(),
        ApplyMode::Add,
    )?;

    platform.sync_all().await?;
    assert_eq!(kernel.objects(ObjectKind::Tfilter).len(), 2);
    assert_eq!(cached_filters(&platform).len(), 2);

    // Removing one of them leaves the other cached.
    let dropper = kernel
        .objects(ObjectKind::Tfilter)
        .into_iter()
        .find(|o| matches!(o, PlatformObject::Tfilter(f) if f.action == Some(TcAction::drop())))
        .expect("drop filter in the kernel");
    kernel.external(dropper, ApplyMode::Delete)?;
    platform.drain().await?;
    let left = cached_filters(&platform);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].action, Some(TcAction::pass()));
    Ok(())
}

#[tokio::test]
async fn test_different_filters_at_one_parent_coexist() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let ifindex = add_ingress(&mut platform).await?;
    let pass: PlatformObject =
        Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::pass()).into();
    let dropper: PlatformObject =
        Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::drop()).into();

    let first = platform.apply(pass.clone(), ApplyMode::Add).await?;
    let second = platform.apply(dropper, ApplyMode::Add).await?;
    assert!(matches!(first, OperationOutcome::Confirmed(_)));
    assert!(matches!(second, OperationOutcome::Confirmed(_)));
    assert_ne!(
        first.object().map(PlatformObject::identity_key),
        second.object().map(PlatformObject::identity_key)
    );
    assert_eq!(cached_filters(&platform).len(), 2);

    kernel.clear_requests();
    let again = platform.apply(pass, ApplyMode::Add).await?;
    assert!(matches!(again, OperationOutcome::Unchanged(_)));
    assert!(kernel.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_filter_delete_after_qdisc_vanished_succeeds() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let ifindex = add_ingress(&mut platform).await?;
    let filter: PlatformObject =
        Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::pass()).into();
    platform.apply(filter.clone(), ApplyMode::Add).await?;
    kernel.silent(Qdisc::ingress(ifindex).into(), ApplyMode::Delete)?;
    kernel.clear_requests();

    let outcome = platform.apply(filter, ApplyMode::Delete).await?;
    assert_eq!(outcome, OperationOutcome::AlreadyAbsent);
    assert_eq!(outcome.status(), Status::Success);
    assert_eq!(kernel.request_count(NlMsgType::RTM_DELTFILTER), 1);
    assert!(cached_filters(&platform).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_filter_delete_without_parent_sends_nothing() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let ifindex = add_link(&mut platform, "test0").await?;
    kernel.clear_requests();

    let keyed = Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::pass()).with_prio(1);
    let outcome = platform.apply(keyed.into(), ApplyMode::Delete).await?;
    assert_eq!(outcome, OperationOutcome::AlreadyAbsent);

    // An unknown filter without a prio never turns into a flush.
    platform
        .apply(Qdisc::ingress(ifindex).into(), ApplyMode::Add)
        .await?;
    platform
        .apply(
            Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::pass()).into(),
            ApplyMode::Add,
        )
        .await?;
    let other = Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::drop());
    let outcome = platform.apply(other.into(), ApplyMode::Delete).await?;
    assert_eq!(outcome, OperationOutcome::AlreadyAbsent);
    assert_eq!(kernel.request_count(NlMsgType::RTM_DELTFILTER), 0);
    assert_eq!(cached_filters(&platform).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_oversized_action_data_is_rejected_before_sending() -> Result<()> {
    let (kernel, mut platform) = platform().await?;
    let ifindex = add_ingress(&mut platform).await?;
    kernel.clear_requests();

    let filter = Tfilter::matchall(
        ifindex,
        TcHandle::INGRESS_QDISC,
        TcAction::simple("x".repeat(70_000)),
    );
    let err = platform
        .apply(filter.into(), ApplyMode::Add)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArgument);
    assert!(kernel.requests().is_empty());
    Ok(())
}
