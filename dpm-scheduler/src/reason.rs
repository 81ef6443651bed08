//! Wake reasons.
//!
//! Every obligation of the station is identified by a bit in a 64-bit mask. Related bits are
//! grouped into a [WakeFamily], which has a base bit and optionally a retry and a time adjust
//! (TA) bit. Only one [Stage] of a family can be armed at any time, which is why the schedule
//! table is keyed by family and the stage is stored next to it.
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

use bitfield_struct::bitfield;
use macro_bits::{bit, check_bit};

use crate::{DpmError, DpmResult};

/// The stage of a family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// The nominal periodic or one-shot wake.
    #[default]
    Base,
    /// A short backoff after the base wake failed.
    Retry,
    /// The retries were exhausted and the handler should use the last known good timing.
    TimeAdjust,
}

/// A group of wake reasons, which share one slot in the schedule table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum WakeFamily {
    /// Receive the beacon with the TIM.
    Tim,
    BeaconLoss,
    BeaconLossConfirm,
    /// Fetch buffered broadcast and multicast frames after the DTIM.
    BcMc,
    PsPoll,
    /// Fetch buffered unicast frames.
    Unicast,
    AutoArp,
    ArpRequest,
    ArpResponse,
    /// UDP hole punch.
    UdpHolePunch,
    TcpKeepAlive,
    /// Null data frame keepalive towards the AP.
    KeepAlive,
    /// Set the power save state at the AP.
    SetPs,
    /// Check that the AP didn't deauthenticate us while sleeping.
    DeauthCheck,
    UnicastCheck,
    /// Cold boot request, which isn't related to the MAC.
    FullBoot0,
    FullBoot1,
}
impl WakeFamily {
    pub const COUNT: usize = 17;
    pub const ALL: [Self; Self::COUNT] = [
        Self::Tim,
        Self::BeaconLoss,
        Self::BeaconLossConfirm,
        Self::BcMc,
        Self::PsPoll,
        Self::Unicast,
        Self::AutoArp,
        Self::ArpRequest,
        Self::ArpResponse,
        Self::UdpHolePunch,
        Self::TcpKeepAlive,
        Self::KeepAlive,
        Self::SetPs,
        Self::DeauthCheck,
        Self::UnicastCheck,
        Self::FullBoot0,
        Self::FullBoot1,
    ];
    pub const fn index(self) -> usize {
        self as usize
    }
    /// The base bit and whether the family has retry and TA siblings.
    ///
    /// Siblings always occupy the two bits following the base bit.
    const fn layout(self) -> (u8, bool) {
        match self {
            Self::Tim => (0, false),
            Self::BeaconLoss => (1, false),
            Self::BeaconLossConfirm => (2, false),
            Self::BcMc => (3, false),
            Self::PsPoll => (4, true),
            Self::Unicast => (7, false),
            Self::AutoArp => (8, true),
            Self::ArpRequest => (11, true),
            Self::ArpResponse => (14, true),
            Self::UdpHolePunch => (17, true),
            Self::TcpKeepAlive => (20, true),
            Self::KeepAlive => (23, true),
            Self::SetPs => (26, true),
            Self::DeauthCheck => (29, true),
            Self::UnicastCheck => (32, false),
            Self::FullBoot0 => (56, false),
            Self::FullBoot1 => (57, false),
        }
    }
    pub const fn base_bit(self) -> u8 {
        self.layout().0
    }
    /// Check if the family has a dedicated bit for `stage`.
    pub const fn has_stage(self, stage: Stage) -> bool {
        match stage {
            Stage::Base => true,
            Stage::Retry | Stage::TimeAdjust => self.layout().1,
        }
    }
    /// The reason, which represents `stage` of this family.
    ///
    /// Families without retry and TA bits keep using their base bit.
    pub const fn reason_for(self, stage: Stage) -> WakeReason {
        WakeReason {
            family: self,
            stage: if self.has_stage(stage) {
                stage
            } else {
                Stage::Base
            },
        }
    }
    pub const fn base(self) -> WakeReason {
        self.reason_for(Stage::Base)
    }
    /// All bits of the family.
    pub const fn mask(self) -> WakeMask {
        let (base, has_siblings) = self.layout();
        let bits: u64 = if has_siblings { 0b111 } else { 0b1 };
        WakeMask(bits << base)
    }
    /// Check if servicing the family requires the MAC.
    pub const fn is_mac_related(self) -> bool {
        WakeMask::MAC.intersects(self.mask())
    }
    /// Whether the family is rearmed after completing, unless configured otherwise.
    pub const fn is_periodic_by_default(self) -> bool {
        !matches!(
            self,
            Self::BeaconLoss
                | Self::BeaconLossConfirm
                | Self::Unicast
                | Self::ArpResponse
                | Self::SetPs
                | Self::FullBoot0
                | Self::FullBoot1
        )
    }
    /// Find the family, which owns bit `position`.
    pub fn from_bit(position: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|family| family.mask().contains_bit(position))
    }
}

/// A single wake reason, i.e. one stage of a family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WakeReason {
    family: WakeFamily,
    stage: Stage,
}
impl WakeReason {
    /// Create a wake reason.
    ///
    /// This fails, if the family has no bit for `stage`.
    pub const fn new(family: WakeFamily, stage: Stage) -> DpmResult<Self> {
        if family.has_stage(stage) {
            Ok(Self { family, stage })
        } else {
            Err(DpmError::InvalidArgument)
        }
    }
    /// Decode the reason from its bit position.
    pub fn from_bit(position: u8) -> Option<Self> {
        let family = WakeFamily::from_bit(position)?;
        let stage = match position - family.base_bit() {
            0 => Stage::Base,
            1 => Stage::Retry,
            _ => Stage::TimeAdjust,
        };
        Some(Self { family, stage })
    }
    pub const fn family(&self) -> WakeFamily {
        self.family
    }
    pub const fn stage(&self) -> Stage {
        self.stage
    }
    /// The position of the bit representing this reason.
    pub const fn bit(&self) -> u8 {
        self.family.base_bit()
            + match self.stage {
                Stage::Base => 0,
                Stage::Retry => 1,
                Stage::TimeAdjust => 2,
            }
    }
    pub const fn mask(&self) -> WakeMask {
        WakeMask(bit!(self.bit()))
    }
}
impl From<WakeReason> for WakeMask {
    fn from(value: WakeReason) -> Self {
        value.mask()
    }
}
impl From<WakeFamily> for WakeMask {
    fn from(value: WakeFamily) -> Self {
        value.mask()
    }
}

/// A set of wake reasons.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WakeMask(u64);
impl WakeMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(u64::MAX);
    /// Everything, which needs the MAC to be serviced.
    pub const MAC: Self = Self(0x00ff_ffff_ffff_ffff);
    /// Everything unrelated to the MAC, like full boot requests.
    pub const NO_MAC: Self = Self(0xff00_0000_0000_0000);
    /// Beacon reception and the detection of its loss.
    pub const TIM_GROUP: Self = Self(0b111);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
    pub const fn into_bits(self) -> u64 {
        self.0
    }
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
    pub const fn contains_bit(self, position: u8) -> bool {
        position < 64 && check_bit!(self.0, bit!(position))
    }
    pub const fn contains(self, reason: WakeReason) -> bool {
        self.contains_bit(reason.bit())
    }
    /// Iterate over the families, which have at least one bit set in this mask.
    pub fn families(self) -> impl Iterator<Item = WakeFamily> {
        WakeFamily::ALL
            .into_iter()
            .filter(move |family| self.intersects(family.mask()))
    }
}
impl BitOr for WakeMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
impl BitOrAssign for WakeMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
impl BitAnd for WakeMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}
impl Not for WakeMask {
    type Output = Self;
    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

/// What has to be powered up, before a wake reason can be serviced.
///
/// An empty preparation means, that neither the MAC nor the application are needed.
#[bitfield(u8)]
#[derive(PartialEq, Eq, Hash)]
pub struct Preparation {
    /// Receiving with the DSSS PHY.
    pub rx_dsss: bool,
    /// Receiving with the OFDM PHY.
    pub rx_ofdm: bool,
    pub tx: bool,
    /// The application has to run.
    pub app: bool,
    #[bits(4)]
    pub __: u8,
}
impl Preparation {
    pub const NO_MAC: Self = Self::new();
    pub const RX_DSSS: Self = Self::new().with_rx_dsss(true);
    pub const RX_OFDM: Self = Self::new().with_rx_ofdm(true);
    pub const TX: Self = Self::new().with_tx(true);
    pub const APP: Self = Self::new().with_app(true);

    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }
    pub const fn is_no_mac(self) -> bool {
        self.into_bits() & 0x0f == 0
    }
    /// Check if the subsystem with `index` is required.
    ///
    /// The index follows the bit order of the fields.
    pub(crate) const fn requires_index(self, index: usize) -> bool {
        index < 4 && check_bit!(self.into_bits(), bit!(index))
    }
}
