//! Event kind names, their hashes and the legacy numeric index table.
//!
//! Events travel either by name hash (V2) or by the index of their kind in
//! the game's event registration order (legacy). [`EventNameTable`]
//! translates between the two at the packet boundary so everything past it
//! only deals in hashes.

use std::sync::LazyLock;

use rustc_hash::{FxHashMap, FxHashSet};
use tether_wire::joaat;

/// Stock event kinds, in registration order.
pub const DEFAULT_EVENT_NAMES: &[&str] = &[
    "OBJECT_ID_FREED_EVENT",
    "OBJECT_ID_REQUEST_EVENT",
    "ARRAY_DATA_VERIFY_EVENT",
    "SCRIPT_ARRAY_DATA_VERIFY_EVENT",
    "REQUEST_CONTROL_EVENT",
    "GIVE_CONTROL_EVENT",
    "WEAPON_DAMAGE_EVENT",
    "REQUEST_PICKUP_EVENT",
    "REQUEST_MAP_PICKUP_EVENT",
    "GAME_CLOCK_EVENT",
    "GAME_WEATHER_EVENT",
    "RESPAWN_PLAYER_PED_EVENT",
    "GIVE_WEAPON_EVENT",
    "REMOVE_WEAPON_EVENT",
    "REMOVE_ALL_WEAPONS_EVENT",
    "VEHICLE_COMPONENT_CONTROL_EVENT",
    "FIRE_EVENT",
    "EXPLOSION_EVENT",
    "START_PROJECTILE_EVENT",
    "UPDATE_PROJECTILE_TARGET_EVENT",
    "REMOVE_PROJECTILE_ENTITY_EVENT",
    "BREAK_PROJECTILE_TARGET_LOCK_EVENT",
    "ALTER_WANTED_LEVEL_EVENT",
    "CHANGE_RADIO_STATION_EVENT",
    "RAGDOLL_REQUEST_EVENT",
    "PLAYER_TAUNT_EVENT",
    "PLAYER_CARD_STAT_EVENT",
    "DOOR_BREAK_EVENT",
    "SCRIPTED_GAME_EVENT",
    "REMOTE_SCRIPT_INFO_EVENT",
    "REMOTE_SCRIPT_LEAVE_EVENT",
    "MARK_AS_NO_LONGER_NEEDED_EVENT",
    "CONVERT_TO_SCRIPT_ENTITY_EVENT",
    "SCRIPT_WORLD_STATE_EVENT",
    "CLEAR_AREA_EVENT",
    "CLEAR_RECTANGLE_AREA_EVENT",
    "REQUEST_NETWORK_SYNCED_SCENE_EVENT",
    "START_NETWORK_SYNCED_SCENE_EVENT",
    "STOP_NETWORK_SYNCED_SCENE_EVENT",
    "UPDATE_NETWORK_SYNCED_SCENE_EVENT",
    "INCIDENT_ENTITY_EVENT",
    "GIVE_PED_SCRIPTED_TASK_EVENT",
    "GIVE_PED_SEQUENCE_TASK_EVENT",
    "NETWORK_CLEAR_PED_TASKS_EVENT",
    "NETWORK_START_PED_ARREST_EVENT",
    "NETWORK_START_PED_UNCUFF_EVENT",
    "NETWORK_SOUND_CAR_HORN_EVENT",
    "NETWORK_ENTITY_AREA_STATUS_EVENT",
    "NETWORK_GARAGE_OCCUPIED_STATUS_EVENT",
    "PED_CONVERSATION_LINE_EVENT",
    "SCRIPT_ENTITY_STATE_CHANGE_EVENT",
    "NETWORK_PLAY_SOUND_EVENT",
    "NETWORK_STOP_SOUND_EVENT",
    "NETWORK_PLAY_AIRDEFENSE_FIRE_EVENT",
    "NETWORK_BANK_REQUEST_EVENT",
    "NETWORK_AUDIO_BARK_EVENT",
    "REQUEST_DOOR_EVENT",
    "NETWORK_TRAIN_REPORT_EVENT",
    "NETWORK_TRAIN_REQUEST_EVENT",
    "NETWORK_INCREMENT_STAT_EVENT",
    "MODIFY_VEHICLE_LOCK_WORD_STATE_DATA",
    "MODIFY_PTFX_WORD_STATE_DATA_SCRIPTED_EVOLVE_EVENT",
    "REQUEST_PHONE_EXPLOSION_EVENT",
    "REQUEST_DETACHMENT_EVENT",
    "KICK_VOTES_EVENT",
    "NETWORK_GIVE_PICKUP_REWARDS_EVENT",
    "NETWORK_CRC_HASH_CHECK_EVENT",
    "BLOW_UP_VEHICLE_EVENT",
    "NETWORK_SPECIAL_FIRE_EQUIPPED_WEAPON",
    "NETWORK_RESPONDED_TO_THREAT_EVENT",
    "NETWORK_SHOUT_TARGET_POSITION",
    "VOICE_DRIVEN_MOUTH_MOVEMENT_FINISHED_EVENT",
    "PICKUP_DESTROYED_EVENT",
    "UPDATE_PLAYER_SCARS_EVENT",
    "NETWORK_CHECK_EXE_SIZE_EVENT",
    "NETWORK_PTFX_EVENT",
    "NETWORK_PED_SEEN_DEAD_PED_EVENT",
    "REMOVE_STICKY_BOMB_EVENT",
    "NETWORK_CHECK_CODE_CRCS_EVENT",
    "INFORM_SILENCED_GUNSHOT_EVENT",
    "PED_PLAY_PAIN_EVENT",
    "CACHE_PLAYER_HEAD_BLEND_DATA_EVENT",
    "REMOVE_PED_FROM_PEDGROUP_EVENT",
    "REPORT_MYSELF_EVENT",
    "REPORT_CASH_SPAWN_EVENT",
    "ACTIVATE_VEHICLE_SPECIAL_ABILITY_EVENT",
    "BLOCK_WEAPON_SELECTION",
    "NETWORK_CHECK_CATALOG_CRC",
    "NETWORK_UPDATE_SYNCED_SCENE_EVENT",
];

/// Kinds that are never accepted from the network.
pub const DENYLISTED_EVENTS: &[&str] = &[
    "GIVE_CONTROL_EVENT",
    "BLOW_UP_VEHICLE_EVENT",
    "KICK_VOTES_EVENT",
    "NETWORK_CRC_HASH_CHECK_EVENT",
    "NETWORK_CHECK_EXE_SIZE_EVENT",
    "NETWORK_CHECK_CODE_CRCS_EVENT",
    "NETWORK_CHECK_CATALOG_CRC",
];

/// Kinds whose host-side comparison has side effects once the earlier
/// instance went out, so a sent instance never absorbs a new one.
pub const SENT_MODIFYING_EVENTS: &[&str] = &[
    "WEAPON_DAMAGE_EVENT",
    "GIVE_WEAPON_EVENT",
    "NETWORK_UPDATE_SYNCED_SCENE_EVENT",
    "NETWORK_GIVE_PICKUP_REWARDS_EVENT",
    "SCRIPTED_GAME_EVENT",
];

/// Synced-scene kinds that must be attributed to the player who started
/// the scene rather than to the relaying peer.
pub const ORIGINAL_PLAYER_EVENTS: &[&str] = &[
    "REQUEST_NETWORK_SYNCED_SCENE_EVENT",
    "START_NETWORK_SYNCED_SCENE_EVENT",
    "STOP_NETWORK_SYNCED_SCENE_EVENT",
    "UPDATE_NETWORK_SYNCED_SCENE_EVENT",
];

fn hash_set(names: &[&str]) -> FxHashSet<u32> {
    names.iter().map(|name| joaat(name)).collect()
}

static DENYLIST: LazyLock<FxHashSet<u32>> = LazyLock::new(|| hash_set(DENYLISTED_EVENTS));
static SENT_MODIFYING: LazyLock<FxHashSet<u32>> =
    LazyLock::new(|| hash_set(SENT_MODIFYING_EVENTS));
static ORIGINAL_PLAYER: LazyLock<FxHashSet<u32>> =
    LazyLock::new(|| hash_set(ORIGINAL_PLAYER_EVENTS));

/// Whether inbound events of this kind are always dropped.
pub fn is_denylisted(name_hash: u32) -> bool {
    DENYLIST.contains(&name_hash)
}

/// Whether a sent instance of this kind must not be compared against.
pub fn is_sent_modifying(name_hash: u32) -> bool {
    SENT_MODIFYING.contains(&name_hash)
}

/// Whether this kind carries the original scene player.
pub fn needs_original_player(name_hash: u32) -> bool {
    ORIGINAL_PLAYER.contains(&name_hash)
}

/// Bidirectional map between legacy type indices and name hashes.
#[derive(Debug, Clone)]
pub struct EventNameTable {
    by_index: Vec<u32>,
    by_hash: FxHashMap<u32, u16>,
}

impl EventNameTable {
    /// Table whose index `i` is the kind `names[i]`.
    ///
    /// Names past `u16::MAX` cannot be addressed by index and are ignored.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self::from_hashes(names.into_iter().map(joaat))
    }

    /// Table built from already hashed names.
    pub fn from_hashes(hashes: impl IntoIterator<Item = u32>) -> Self {
        let by_index: Vec<u32> = hashes.into_iter().take(usize::from(u16::MAX) + 1).collect();
        let mut by_hash = FxHashMap::default();
        for (index, hash) in by_index.iter().enumerate() {
            // first registration wins for duplicate names
            by_hash.entry(*hash).or_insert(index as u16);
        }
        Self { by_index, by_hash }
    }

    /// Name hash of a legacy index.
    pub fn hash_of(&self, index: u16) -> Option<u32> {
        self.by_index.get(usize::from(index)).copied()
    }

    /// Legacy index of a name hash.
    pub fn index_of(&self, name_hash: u32) -> Option<u16> {
        self.by_hash.get(&name_hash).copied()
    }

    /// Whether the kind is known at all.
    pub fn contains(&self, name_hash: u32) -> bool {
        self.by_hash.contains_key(&name_hash)
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

impl Default for EventNameTable {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_NAMES.iter().copied())
    }
}
