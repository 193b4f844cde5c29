//! Delivery scopes

use std::convert::TryFrom;

use crate::error::RouterError;

/// Which sessions a packet goes to, relative to its origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SendTarget {
    AllClients = 0,
    AllSameMap = 1,
    Area = 2,
    AreaWithoutSelf = 3,
    AreaWithoutChat = 4,
    AreaWithoutSameChat = 5,
    AreaChatWithoutChat = 6,
    Chat = 7,
    ChatWithoutSelf = 8,
    Party = 9,
    PartyWithoutSelf = 10,
    PartySameMap = 11,
    PartySameMapWithoutSelf = 12,
    PartyArea = 13,
    PartyAreaWithoutSelf = 14,
    Guild = 15,
    GuildWithoutSelf = 16,
    GuildSameMap = 17,
    GuildSameMapWithoutSelf = 18,
    GuildArea = 19,
    GuildAreaWithoutSelf = 20,
    GuildNoBattleground = 21,
    Duel = 22,
    DuelWithoutSelf = 23,
    SelfOnly = 24,
    Battleground = 25,
    BattlegroundWithoutSelf = 26,
    BattlegroundSameMap = 27,
    BattlegroundSameMapWithoutSelf = 28,
    BattlegroundArea = 29,
    BattlegroundAreaWithoutSelf = 30,
    AreaDead = 32,
    Clan = 33,
    ClanWithoutSelf = 34,
}

impl SendTarget {
    /// Every target, in code order
    pub const ALL: [SendTarget; 34] = [
        SendTarget::AllClients,
        SendTarget::AllSameMap,
        SendTarget::Area,
        SendTarget::AreaWithoutSelf,
        SendTarget::AreaWithoutChat,
        SendTarget::AreaWithoutSameChat,
        SendTarget::AreaChatWithoutChat,
        SendTarget::Chat,
        SendTarget::ChatWithoutSelf,
        SendTarget::Party,
        SendTarget::PartyWithoutSelf,
        SendTarget::PartySameMap,
        SendTarget::PartySameMapWithoutSelf,
        SendTarget::PartyArea,
        SendTarget::PartyAreaWithoutSelf,
        SendTarget::Guild,
        SendTarget::GuildWithoutSelf,
        SendTarget::GuildSameMap,
        SendTarget::GuildSameMapWithoutSelf,
        SendTarget::GuildArea,
        SendTarget::GuildAreaWithoutSelf,
        SendTarget::GuildNoBattleground,
        SendTarget::Duel,
        SendTarget::DuelWithoutSelf,
        SendTarget::SelfOnly,
        SendTarget::Battleground,
        SendTarget::BattlegroundWithoutSelf,
        SendTarget::BattlegroundSameMap,
        SendTarget::BattlegroundSameMapWithoutSelf,
        SendTarget::BattlegroundArea,
        SendTarget::BattlegroundAreaWithoutSelf,
        SendTarget::AreaDead,
        SendTarget::Clan,
        SendTarget::ClanWithoutSelf,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the origin itself is skipped
    pub fn excludes_self(self) -> bool {
        matches!(
            self,
            SendTarget::AreaWithoutSelf
                | SendTarget::AreaWithoutChat
                | SendTarget::AreaChatWithoutChat
                | SendTarget::ChatWithoutSelf
                | SendTarget::PartyWithoutSelf
                | SendTarget::PartySameMapWithoutSelf
                | SendTarget::PartyAreaWithoutSelf
                | SendTarget::GuildWithoutSelf
                | SendTarget::GuildSameMapWithoutSelf
                | SendTarget::GuildAreaWithoutSelf
                | SendTarget::DuelWithoutSelf
                | SendTarget::BattlegroundWithoutSelf
                | SendTarget::BattlegroundSameMapWithoutSelf
                | SendTarget::BattlegroundAreaWithoutSelf
                | SendTarget::ClanWithoutSelf
        )
    }

    /// Targets resolved through the spatial index around the origin
    pub fn is_area(self) -> bool {
        matches!(
            self,
            SendTarget::Area
                | SendTarget::AreaWithoutSelf
                | SendTarget::AreaWithoutChat
                | SendTarget::AreaWithoutSameChat
                | SendTarget::AreaChatWithoutChat
                | SendTarget::AreaDead
        )
    }
}

impl TryFrom<u8> for SendTarget {
    type Error = RouterError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        SendTarget::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or(RouterError::UnknownTarget(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for target in SendTarget::ALL {
            assert_eq!(SendTarget::try_from(target.code()), Ok(target));
        }
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(SendTarget::try_from(31), Err(RouterError::UnknownTarget(31)));
        assert_eq!(SendTarget::try_from(200), Err(RouterError::UnknownTarget(200)));
    }

    #[test]
    fn test_self_exclusion() {
        assert!(SendTarget::AreaWithoutSelf.excludes_self());
        assert!(!SendTarget::Area.excludes_self());
        assert!(SendTarget::AreaDead.is_area());
        assert!(!SendTarget::PartyArea.is_area());
    }
}
