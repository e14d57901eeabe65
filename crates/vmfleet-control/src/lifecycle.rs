//! Start and stop primitives.
//!
//! Both check the current domain state, issue the hypervisor command and then
//! wait for the target state. Waits select over a deadline, a polling tick and
//! (for boots) the phone-home stream. The tick catches crashes and shutoffs,
//! the stream catches success; whichever is observed first decides.

use std::time::Duration;

use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vmfleet_core::SecretUuid;
use vmfleet_hypervisor::{DomainState, Hypervisor};

use crate::error::{ControlError, Result};
use crate::phone_home::{PhoneCall, PhoneHomeBus, PhoneHomeSubscription};

/// What ends a boot wait successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootGoal {
    /// The guest phoned home.
    PhoneHome,
    /// The guest phoned home and is powered off, ready to be booted again.
    PhoneHomeThenShutOff,
}

/// Wait for a booting domain to reach `goal`.
///
/// A matching phone-home confirms the boot. For
/// [`BootGoal::PhoneHomeThenShutOff`] a domain still up at that point is then
/// polled until it powers off, within the same `timeout`. Calls carrying a
/// different secret are ignored; a repeated call for the same secret replaces
/// the earlier one and a changed address is logged.
///
/// `ShutOff` only counts as the guest powering itself off once an earlier
/// poll of this wait saw the domain up. Before that it is ignored.
///
/// # Errors
///
/// - `ControlError::Crashed` if the domain is observed crashed first.
/// - `ControlError::HandshakeMissing` if the domain goes from up to shut off
///   without phoning home.
/// - `ControlError::Timeout` if `timeout` elapses first.
pub async fn wait_for_boot<H: Hypervisor + ?Sized>(
    hypervisor: &H,
    subscription: &mut PhoneHomeSubscription,
    domain: &str,
    secret: &SecretUuid,
    goal: BootGoal,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<PhoneCall> {
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut seen_up = false;
    let mut confirmed: Option<PhoneCall> = None;

    loop {
        tokio::select! {
            () = &mut deadline => {
                return Err(ControlError::Timeout(format!("boot of {domain}")));
            }
            _ = ticker.tick() => {
                match hypervisor.domain_state(domain).await? {
                    DomainState::Crashed => {
                        return Err(ControlError::Crashed(domain.to_string()));
                    }
                    DomainState::ShutOff => {
                        if let Some(call) = confirmed {
                            info!(domain = %domain, "Domain powered off after phoning home");
                            return Ok(call);
                        }
                        if seen_up {
                            return Err(ControlError::HandshakeMissing(domain.to_string()));
                        }
                        debug!(domain = %domain, "Domain not up yet");
                    }
                    state => {
                        seen_up |= state.is_up();
                        debug!(domain = %domain, %state, "Waiting for boot");
                    }
                }
            }
            call = subscription.recv_for(secret) => {
                let Some(call) = call else {
                    return Err(ControlError::Internal("phone-home bus closed".to_string()));
                };

                info!(domain = %domain, remote_ip = %call.remote_ip, "Domain phoned home");
                if let Some(previous) = &confirmed {
                    if previous.remote_ip != call.remote_ip {
                        warn!(
                            domain = %domain,
                            old_ip = %previous.remote_ip,
                            new_ip = %call.remote_ip,
                            "Domain phoned home from a new address"
                        );
                    }
                }

                if goal == BootGoal::PhoneHome {
                    return Ok(call);
                }
                match hypervisor.domain_state(domain).await? {
                    DomainState::ShutOff => return Ok(call),
                    DomainState::Crashed => {
                        return Err(ControlError::Crashed(domain.to_string()));
                    }
                    state => {
                        debug!(domain = %domain, %state, "Waiting for power-off");
                        confirmed = Some(call);
                    }
                }
            }
        }
    }
}

/// Boot a shut-off domain and wait for it to phone home.
///
/// # Errors
///
/// Returns `ControlError::UnexpectedState` if the domain is not shut off, or
/// any error of [`wait_for_boot`].
pub async fn start<H: Hypervisor + ?Sized>(
    hypervisor: &H,
    bus: &PhoneHomeBus,
    domain: &str,
    secret: &SecretUuid,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<PhoneCall> {
    let state = hypervisor.domain_state(domain).await?;
    if state != DomainState::ShutOff {
        return Err(ControlError::UnexpectedState {
            domain: domain.to_string(),
            expected: DomainState::ShutOff,
            actual: state,
        });
    }

    // Register before booting so an early call cannot be missed.
    let mut subscription = bus.register();
    hypervisor.start_domain(domain).await?;
    info!(domain = %domain, "Started domain");

    wait_for_boot(
        hypervisor,
        &mut subscription,
        domain,
        secret,
        BootGoal::PhoneHome,
        timeout,
        poll_interval,
    )
    .await
}

/// Gracefully shut down a running domain and wait until it is off.
///
/// # Errors
///
/// Returns `ControlError::UnexpectedState` if the domain is not running,
/// `ControlError::Timeout` if it does not shut off in time.
pub async fn stop<H: Hypervisor + ?Sized>(
    hypervisor: &H,
    domain: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let state = hypervisor.domain_state(domain).await?;
    if state != DomainState::Running {
        return Err(ControlError::UnexpectedState {
            domain: domain.to_string(),
            expected: DomainState::Running,
            actual: state,
        });
    }

    hypervisor.shutdown_domain(domain).await?;
    info!(domain = %domain, "Requested domain shutdown");

    let deadline = sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = &mut deadline => {
                return Err(ControlError::Timeout(format!("shutdown of {domain}")));
            }
            _ = ticker.tick() => {
                let state = hypervisor.domain_state(domain).await?;
                if state == DomainState::ShutOff {
                    info!(domain = %domain, "Domain stopped");
                    return Ok(());
                }
                debug!(domain = %domain, %state, "Waiting for shutdown");
            }
        }
    }
}
