// I3 packet model
//
// Every message on the I3 wire is an LPC array whose first six elements form
// a fixed header: type tag, TTL, originator mud/user, target mud/user. This
// module turns decoded LPC values into a typed packet enum that handlers can
// pattern-match, and back again for the codec. Unknown tags are preserved in
// an Opaque variant so forwarding still works.

use crate::error::{GatewayError, Result};
use crate::network::lpc::LpcValue;

/// Broadcast marker on target fields
pub const BROADCAST: &str = "0";

/// Default TTL for locally-originated packets
pub const DEFAULT_TTL: i32 = 200;

/// The recognized I3 packet type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Tell,
    Emoteto,
    ChannelM,
    ChannelE,
    ChannelT,
    ChannelAdd,
    ChannelRemove,
    ChannelAdmin,
    ChanlistReply,
    ChannelListen,
    ChannelWhoReq,
    ChannelWhoReply,
    WhoReq,
    WhoReply,
    FingerReq,
    FingerReply,
    LocateReq,
    LocateReply,
    Mudlist,
    StartupReq3,
    StartupReply,
    Error,
}

impl PacketType {
    /// The wire tag for this packet type
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Tell => "tell",
            PacketType::Emoteto => "emoteto",
            PacketType::ChannelM => "channel-m",
            PacketType::ChannelE => "channel-e",
            PacketType::ChannelT => "channel-t",
            PacketType::ChannelAdd => "channel-add",
            PacketType::ChannelRemove => "channel-remove",
            PacketType::ChannelAdmin => "channel-admin",
            PacketType::ChanlistReply => "chanlist-reply",
            PacketType::ChannelListen => "channel-listen",
            PacketType::ChannelWhoReq => "channel-who-req",
            PacketType::ChannelWhoReply => "channel-who-reply",
            PacketType::WhoReq => "who-req",
            PacketType::WhoReply => "who-reply",
            PacketType::FingerReq => "finger-req",
            PacketType::FingerReply => "finger-reply",
            PacketType::LocateReq => "locate-req",
            PacketType::LocateReply => "locate-reply",
            PacketType::Mudlist => "mudlist",
            PacketType::StartupReq3 => "startup-req-3",
            PacketType::StartupReply => "startup-reply",
            PacketType::Error => "error",
        }
    }

    /// Map a wire tag to a packet type; None for unrecognized tags
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "tell" => PacketType::Tell,
            "emoteto" => PacketType::Emoteto,
            "channel-m" => PacketType::ChannelM,
            "channel-e" => PacketType::ChannelE,
            "channel-t" => PacketType::ChannelT,
            "channel-add" => PacketType::ChannelAdd,
            "channel-remove" => PacketType::ChannelRemove,
            "channel-admin" => PacketType::ChannelAdmin,
            "chanlist-reply" => PacketType::ChanlistReply,
            "channel-listen" => PacketType::ChannelListen,
            "channel-who-req" => PacketType::ChannelWhoReq,
            "channel-who-reply" => PacketType::ChannelWhoReply,
            "who-req" => PacketType::WhoReq,
            "who-reply" => PacketType::WhoReply,
            "finger-req" => PacketType::FingerReq,
            "finger-reply" => PacketType::FingerReply,
            "locate-req" => PacketType::LocateReq,
            "locate-reply" => PacketType::LocateReply,
            "mudlist" => PacketType::Mudlist,
            "startup-req-3" => PacketType::StartupReq3,
            "startup-reply" => PacketType::StartupReply,
            "error" => PacketType::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six-field header common to every I3 packet
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PacketHeader {
    pub ttl: i32,
    pub originator_mud: String,
    pub originator_user: String,
    pub target_mud: String,
    pub target_user: String,
}

impl PacketHeader {
    pub fn new(
        ttl: i32,
        originator_mud: impl Into<String>,
        originator_user: impl Into<String>,
        target_mud: impl Into<String>,
        target_user: impl Into<String>,
    ) -> Self {
        Self {
            ttl,
            originator_mud: originator_mud.into(),
            originator_user: originator_user.into(),
            target_mud: target_mud.into(),
            target_user: target_user.into(),
        }
    }

    /// Whether this packet is addressed to the whole network
    pub fn is_broadcast(&self) -> bool {
        self.target_mud == BROADCAST
    }

    /// Header for a reply addressed back at this packet's originator
    pub fn reply_to(&self, our_mud: &str) -> PacketHeader {
        PacketHeader::new(
            DEFAULT_TTL,
            our_mud,
            String::new(),
            self.originator_mud.clone(),
            self.originator_user.clone(),
        )
    }
}

/// One entry of a chanlist-reply mapping; None payload means removal
#[derive(Debug, Clone, PartialEq)]
pub struct ChanlistEntry {
    pub name: String,
    /// (owner mud, channel type); None when the router deleted the channel
    pub info: Option<(String, i32)>,
}

/// A typed I3 packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Tell {
        header: PacketHeader,
        visname: String,
        message: String,
    },
    Emoteto {
        header: PacketHeader,
        visname: String,
        message: String,
    },
    ChannelMessage {
        header: PacketHeader,
        channel: String,
        visname: String,
        message: String,
    },
    ChannelEmote {
        header: PacketHeader,
        channel: String,
        visname: String,
        message: String,
    },
    ChannelTarget {
        header: PacketHeader,
        channel: String,
        targetted_mud: String,
        targetted_user: String,
        message_others: String,
        message_target: String,
        originator_visname: String,
        target_visname: String,
    },
    ChannelAdd {
        header: PacketHeader,
        channel: String,
        channel_type: i32,
    },
    ChannelRemove {
        header: PacketHeader,
        channel: String,
    },
    ChannelAdmin {
        header: PacketHeader,
        channel: String,
        add_muds: Vec<String>,
        remove_muds: Vec<String>,
    },
    ChanlistReply {
        header: PacketHeader,
        chanlist_id: i32,
        channels: Vec<ChanlistEntry>,
    },
    ChannelListen {
        header: PacketHeader,
        channel: String,
        on: bool,
    },
    ChannelWhoReq {
        header: PacketHeader,
        channel: String,
    },
    ChannelWhoReply {
        header: PacketHeader,
        channel: String,
        users: Vec<String>,
    },
    WhoReq {
        header: PacketHeader,
        /// Raw filter mapping; recognized keys are level_min, level_max,
        /// race and guild
        filter: Vec<(LpcValue, LpcValue)>,
    },
    WhoReply {
        header: PacketHeader,
        /// One mapping per listed user
        who_data: Vec<LpcValue>,
    },
    FingerReq {
        header: PacketHeader,
        target_user: String,
    },
    FingerReply {
        header: PacketHeader,
        user_info: Vec<(LpcValue, LpcValue)>,
    },
    LocateReq {
        header: PacketHeader,
        user_to_locate: String,
    },
    LocateReply {
        header: PacketHeader,
        located_mud: String,
        located_user: String,
        idle_time: i32,
        status_string: String,
    },
    Mudlist {
        header: PacketHeader,
        mudlist_id: i32,
        /// mud name -> 15-field info array (or 0 when the router removed it)
        muds: Vec<(String, LpcValue)>,
    },
    StartupReq3 {
        header: PacketHeader,
        password: i32,
        old_mudlist_id: i32,
        old_chanlist_id: i32,
        player_port: i32,
        tcp_port: i32,
        udp_port: i32,
        mudlib: String,
        base_mudlib: String,
        driver: String,
        mud_type: String,
        open_status: String,
        admin_email: String,
        services: Vec<(LpcValue, LpcValue)>,
        other_data: LpcValue,
    },
    StartupReply {
        header: PacketHeader,
        /// (router name, "address port") pairs
        router_list: Vec<(String, String)>,
        password: i32,
    },
    Error {
        header: PacketHeader,
        error_code: String,
        error_message: String,
        bad_packet: Option<Box<LpcValue>>,
    },
    /// Unrecognized tag; payload preserved verbatim for forwarding
    Opaque {
        tag: String,
        header: PacketHeader,
        payload: Vec<LpcValue>,
    },
}

/// Read a header field, treating wire zero as absent
fn field_str(values: &[LpcValue], idx: usize) -> String {
    match values.get(idx) {
        Some(v) if v.is_zero() => String::new(),
        Some(v) => v.to_string_lossy(),
        None => String::new(),
    }
}

/// Read a target field, normalizing integer zero to the broadcast marker
fn target_str(values: &[LpcValue], idx: usize) -> String {
    match values.get(idx) {
        Some(LpcValue::Str(s)) => s.clone(),
        Some(v) if v.is_zero() => BROADCAST.to_string(),
        Some(v) => v.to_string_lossy(),
        None => String::new(),
    }
}

fn field_int(values: &[LpcValue], idx: usize) -> i32 {
    values.get(idx).and_then(|v| v.as_int()).unwrap_or(0)
}

fn field_mapping(values: &[LpcValue], idx: usize) -> Vec<(LpcValue, LpcValue)> {
    values
        .get(idx)
        .and_then(|v| v.as_mapping())
        .map(|pairs| pairs.to_vec())
        .unwrap_or_default()
}

fn string_array(value: Option<&LpcValue>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| items.iter().map(|v| v.to_string_lossy()).collect())
        .unwrap_or_default()
}

/// Encode a possibly-empty string field; empty emits integer zero
fn str_or_zero(s: &str) -> LpcValue {
    if s.is_empty() {
        LpcValue::Int(0)
    } else {
        LpcValue::Str(s.to_string())
    }
}

impl Packet {
    /// Construct a typed packet from a decoded top-level LPC value
    pub fn from_lpc(value: LpcValue) -> Result<Packet> {
        let values = match value {
            LpcValue::Array(items) => items,
            other => {
                return Err(GatewayError::Protocol(format!(
                    "packet is not an array: {:?}",
                    other
                )))
            }
        };
        if values.len() < 6 {
            return Err(GatewayError::Protocol(format!(
                "packet array too short: {} elements",
                values.len()
            )));
        }

        let tag = values[0].to_string_lossy();
        let header = PacketHeader {
            ttl: field_int(&values, 1),
            originator_mud: field_str(&values, 2),
            originator_user: field_str(&values, 3),
            target_mud: target_str(&values, 4),
            target_user: field_str(&values, 5),
        };
        let p = &values[6..];

        let packet = match PacketType::from_tag(&tag) {
            Some(PacketType::Tell) => Packet::Tell {
                header,
                visname: field_str(p, 0),
                message: field_str(p, 1),
            },
            Some(PacketType::Emoteto) => Packet::Emoteto {
                header,
                visname: field_str(p, 0),
                message: field_str(p, 1),
            },
            Some(PacketType::ChannelM) => Packet::ChannelMessage {
                header,
                channel: field_str(p, 0),
                visname: field_str(p, 1),
                message: field_str(p, 2),
            },
            Some(PacketType::ChannelE) => Packet::ChannelEmote {
                header,
                channel: field_str(p, 0),
                visname: field_str(p, 1),
                message: field_str(p, 2),
            },
            Some(PacketType::ChannelT) => Packet::ChannelTarget {
                header,
                channel: field_str(p, 0),
                targetted_mud: field_str(p, 1),
                targetted_user: field_str(p, 2),
                message_others: field_str(p, 3),
                message_target: field_str(p, 4),
                originator_visname: field_str(p, 5),
                target_visname: field_str(p, 6),
            },
            Some(PacketType::ChannelAdd) => Packet::ChannelAdd {
                header,
                channel: field_str(p, 0),
                channel_type: field_int(p, 1),
            },
            Some(PacketType::ChannelRemove) => Packet::ChannelRemove {
                header,
                channel: field_str(p, 0),
            },
            Some(PacketType::ChannelAdmin) => Packet::ChannelAdmin {
                header,
                channel: field_str(p, 0),
                add_muds: string_array(p.get(1)),
                remove_muds: string_array(p.get(2)),
            },
            Some(PacketType::ChanlistReply) => {
                let mut channels = Vec::new();
                for (key, val) in field_mapping(p, 1) {
                    let name = key.to_string_lossy();
                    let info = val.as_array().map(|items| {
                        (
                            items.first().map(|v| v.to_string_lossy()).unwrap_or_default(),
                            items.get(1).and_then(|v| v.as_int()).unwrap_or(0),
                        )
                    });
                    channels.push(ChanlistEntry { name, info });
                }
                Packet::ChanlistReply {
                    header,
                    chanlist_id: field_int(p, 0),
                    channels,
                }
            }
            Some(PacketType::ChannelListen) => Packet::ChannelListen {
                header,
                channel: field_str(p, 0),
                on: field_int(p, 1) != 0,
            },
            Some(PacketType::ChannelWhoReq) => Packet::ChannelWhoReq {
                header,
                channel: field_str(p, 0),
            },
            Some(PacketType::ChannelWhoReply) => Packet::ChannelWhoReply {
                header,
                channel: field_str(p, 0),
                users: string_array(p.get(1)),
            },
            Some(PacketType::WhoReq) => Packet::WhoReq {
                header,
                filter: field_mapping(p, 0),
            },
            Some(PacketType::WhoReply) => Packet::WhoReply {
                header,
                who_data: p
                    .first()
                    .and_then(|v| v.as_array())
                    .map(|items| items.to_vec())
                    .unwrap_or_default(),
            },
            Some(PacketType::FingerReq) => Packet::FingerReq {
                header,
                target_user: field_str(p, 0),
            },
            Some(PacketType::FingerReply) => Packet::FingerReply {
                header,
                user_info: field_mapping(p, 0),
            },
            Some(PacketType::LocateReq) => Packet::LocateReq {
                header,
                user_to_locate: field_str(p, 0),
            },
            Some(PacketType::LocateReply) => Packet::LocateReply {
                header,
                located_mud: field_str(p, 0),
                located_user: field_str(p, 1),
                idle_time: field_int(p, 2),
                status_string: field_str(p, 3),
            },
            Some(PacketType::Mudlist) => {
                let muds = field_mapping(p, 1)
                    .into_iter()
                    .map(|(key, val)| (key.to_string_lossy(), val))
                    .collect();
                Packet::Mudlist {
                    header,
                    mudlist_id: field_int(p, 0),
                    muds,
                }
            }
            Some(PacketType::StartupReq3) => Packet::StartupReq3 {
                header,
                password: field_int(p, 0),
                old_mudlist_id: field_int(p, 1),
                old_chanlist_id: field_int(p, 2),
                player_port: field_int(p, 3),
                tcp_port: field_int(p, 4),
                udp_port: field_int(p, 5),
                mudlib: field_str(p, 6),
                base_mudlib: field_str(p, 7),
                driver: field_str(p, 8),
                mud_type: field_str(p, 9),
                open_status: field_str(p, 10),
                admin_email: field_str(p, 11),
                services: field_mapping(p, 12),
                other_data: p.get(13).cloned().unwrap_or(LpcValue::Int(0)),
            },
            Some(PacketType::StartupReply) => {
                let router_list = p
                    .first()
                    .and_then(|v| v.as_array())
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|entry| entry.as_array())
                            .map(|pair| {
                                (
                                    pair.first().map(|v| v.to_string_lossy()).unwrap_or_default(),
                                    pair.get(1).map(|v| v.to_string_lossy()).unwrap_or_default(),
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Packet::StartupReply {
                    header,
                    router_list,
                    password: field_int(p, 1),
                }
            }
            Some(PacketType::Error) => Packet::Error {
                header,
                error_code: field_str(p, 0),
                error_message: field_str(p, 1),
                bad_packet: p
                    .get(2)
                    .filter(|v| !v.is_zero())
                    .cloned()
                    .map(Box::new),
            },
            None => Packet::Opaque {
                tag,
                header,
                payload: p.to_vec(),
            },
        };
        Ok(packet)
    }

    /// Emit this packet as a top-level LPC array for the codec
    pub fn to_lpc(&self) -> LpcValue {
        let header = self.header();
        let mut values = vec![
            LpcValue::string(self.type_tag()),
            LpcValue::Int(header.ttl),
            str_or_zero(&header.originator_mud),
            str_or_zero(&header.originator_user),
            str_or_zero(&header.target_mud),
            str_or_zero(&header.target_user),
        ];

        match self {
            Packet::Tell { visname, message, .. } | Packet::Emoteto { visname, message, .. } => {
                values.push(str_or_zero(visname));
                values.push(LpcValue::string(message.clone()));
            }
            Packet::ChannelMessage { channel, visname, message, .. }
            | Packet::ChannelEmote { channel, visname, message, .. } => {
                values.push(LpcValue::string(channel.clone()));
                values.push(str_or_zero(visname));
                values.push(LpcValue::string(message.clone()));
            }
            Packet::ChannelTarget {
                channel,
                targetted_mud,
                targetted_user,
                message_others,
                message_target,
                originator_visname,
                target_visname,
                ..
            } => {
                values.push(LpcValue::string(channel.clone()));
                values.push(str_or_zero(targetted_mud));
                values.push(str_or_zero(targetted_user));
                values.push(LpcValue::string(message_others.clone()));
                values.push(LpcValue::string(message_target.clone()));
                values.push(str_or_zero(originator_visname));
                values.push(str_or_zero(target_visname));
            }
            Packet::ChannelAdd { channel, channel_type, .. } => {
                values.push(LpcValue::string(channel.clone()));
                values.push(LpcValue::Int(*channel_type));
            }
            Packet::ChannelRemove { channel, .. } => {
                values.push(LpcValue::string(channel.clone()));
            }
            Packet::ChannelAdmin { channel, add_muds, remove_muds, .. } => {
                values.push(LpcValue::string(channel.clone()));
                values.push(LpcValue::Array(
                    add_muds.iter().map(|m| LpcValue::string(m.clone())).collect(),
                ));
                values.push(LpcValue::Array(
                    remove_muds.iter().map(|m| LpcValue::string(m.clone())).collect(),
                ));
            }
            Packet::ChanlistReply { chanlist_id, channels, .. } => {
                values.push(LpcValue::Int(*chanlist_id));
                values.push(LpcValue::Mapping(
                    channels
                        .iter()
                        .map(|entry| {
                            let value = match &entry.info {
                                Some((owner, ctype)) => LpcValue::Array(vec![
                                    LpcValue::string(owner.clone()),
                                    LpcValue::Int(*ctype),
                                ]),
                                None => LpcValue::Int(0),
                            };
                            (LpcValue::string(entry.name.clone()), value)
                        })
                        .collect(),
                ));
            }
            Packet::ChannelListen { channel, on, .. } => {
                values.push(LpcValue::string(channel.clone()));
                values.push(LpcValue::Int(if *on { 1 } else { 0 }));
            }
            Packet::ChannelWhoReq { channel, .. } => {
                values.push(LpcValue::string(channel.clone()));
            }
            Packet::ChannelWhoReply { channel, users, .. } => {
                values.push(LpcValue::string(channel.clone()));
                values.push(LpcValue::Array(
                    users.iter().map(|u| LpcValue::string(u.clone())).collect(),
                ));
            }
            Packet::WhoReq { filter, .. } => {
                values.push(LpcValue::Mapping(filter.clone()));
            }
            Packet::WhoReply { who_data, .. } => {
                values.push(LpcValue::Array(who_data.clone()));
            }
            Packet::FingerReq { target_user, .. } => {
                values.push(LpcValue::string(target_user.clone()));
            }
            Packet::FingerReply { user_info, .. } => {
                values.push(LpcValue::Mapping(user_info.clone()));
            }
            Packet::LocateReq { user_to_locate, .. } => {
                values.push(LpcValue::string(user_to_locate.clone()));
            }
            Packet::LocateReply {
                located_mud,
                located_user,
                idle_time,
                status_string,
                ..
            } => {
                values.push(LpcValue::string(located_mud.clone()));
                values.push(LpcValue::string(located_user.clone()));
                values.push(LpcValue::Int(*idle_time));
                values.push(LpcValue::string(status_string.clone()));
            }
            Packet::Mudlist { mudlist_id, muds, .. } => {
                values.push(LpcValue::Int(*mudlist_id));
                values.push(LpcValue::Mapping(
                    muds.iter()
                        .map(|(name, info)| (LpcValue::string(name.clone()), info.clone()))
                        .collect(),
                ));
            }
            Packet::StartupReq3 {
                password,
                old_mudlist_id,
                old_chanlist_id,
                player_port,
                tcp_port,
                udp_port,
                mudlib,
                base_mudlib,
                driver,
                mud_type,
                open_status,
                admin_email,
                services,
                other_data,
                ..
            } => {
                values.push(LpcValue::Int(*password));
                values.push(LpcValue::Int(*old_mudlist_id));
                values.push(LpcValue::Int(*old_chanlist_id));
                values.push(LpcValue::Int(*player_port));
                values.push(LpcValue::Int(*tcp_port));
                values.push(LpcValue::Int(*udp_port));
                values.push(LpcValue::string(mudlib.clone()));
                values.push(LpcValue::string(base_mudlib.clone()));
                values.push(LpcValue::string(driver.clone()));
                values.push(LpcValue::string(mud_type.clone()));
                values.push(LpcValue::string(open_status.clone()));
                values.push(LpcValue::string(admin_email.clone()));
                values.push(LpcValue::Mapping(services.clone()));
                values.push(other_data.clone());
            }
            Packet::StartupReply { router_list, password, .. } => {
                values.push(LpcValue::Array(
                    router_list
                        .iter()
                        .map(|(name, addr)| {
                            LpcValue::Array(vec![
                                LpcValue::string(name.clone()),
                                LpcValue::string(addr.clone()),
                            ])
                        })
                        .collect(),
                ));
                values.push(LpcValue::Int(*password));
            }
            Packet::Error { error_code, error_message, bad_packet, .. } => {
                values.push(LpcValue::string(error_code.clone()));
                values.push(LpcValue::string(error_message.clone()));
                values.push(match bad_packet {
                    Some(v) => (**v).clone(),
                    None => LpcValue::Int(0),
                });
            }
            Packet::Opaque { payload, .. } => {
                values.extend(payload.iter().cloned());
            }
        }

        LpcValue::Array(values)
    }

    /// The wire tag of this packet
    pub fn type_tag(&self) -> &str {
        match self {
            Packet::Tell { .. } => PacketType::Tell.as_str(),
            Packet::Emoteto { .. } => PacketType::Emoteto.as_str(),
            Packet::ChannelMessage { .. } => PacketType::ChannelM.as_str(),
            Packet::ChannelEmote { .. } => PacketType::ChannelE.as_str(),
            Packet::ChannelTarget { .. } => PacketType::ChannelT.as_str(),
            Packet::ChannelAdd { .. } => PacketType::ChannelAdd.as_str(),
            Packet::ChannelRemove { .. } => PacketType::ChannelRemove.as_str(),
            Packet::ChannelAdmin { .. } => PacketType::ChannelAdmin.as_str(),
            Packet::ChanlistReply { .. } => PacketType::ChanlistReply.as_str(),
            Packet::ChannelListen { .. } => PacketType::ChannelListen.as_str(),
            Packet::ChannelWhoReq { .. } => PacketType::ChannelWhoReq.as_str(),
            Packet::ChannelWhoReply { .. } => PacketType::ChannelWhoReply.as_str(),
            Packet::WhoReq { .. } => PacketType::WhoReq.as_str(),
            Packet::WhoReply { .. } => PacketType::WhoReply.as_str(),
            Packet::FingerReq { .. } => PacketType::FingerReq.as_str(),
            Packet::FingerReply { .. } => PacketType::FingerReply.as_str(),
            Packet::LocateReq { .. } => PacketType::LocateReq.as_str(),
            Packet::LocateReply { .. } => PacketType::LocateReply.as_str(),
            Packet::Mudlist { .. } => PacketType::Mudlist.as_str(),
            Packet::StartupReq3 { .. } => PacketType::StartupReq3.as_str(),
            Packet::StartupReply { .. } => PacketType::StartupReply.as_str(),
            Packet::Error { .. } => PacketType::Error.as_str(),
            Packet::Opaque { tag, .. } => tag,
        }
    }

    /// The recognized packet type; None for Opaque packets
    pub fn packet_type(&self) -> Option<PacketType> {
        match self {
            Packet::Opaque { .. } => None,
            _ => PacketType::from_tag(self.type_tag()),
        }
    }

    pub fn header(&self) -> &PacketHeader {
        match self {
            Packet::Tell { header, .. }
            | Packet::Emoteto { header, .. }
            | Packet::ChannelMessage { header, .. }
            | Packet::ChannelEmote { header, .. }
            | Packet::ChannelTarget { header, .. }
            | Packet::ChannelAdd { header, .. }
            | Packet::ChannelRemove { header, .. }
            | Packet::ChannelAdmin { header, .. }
            | Packet::ChanlistReply { header, .. }
            | Packet::ChannelListen { header, .. }
            | Packet::ChannelWhoReq { header, .. }
            | Packet::ChannelWhoReply { header, .. }
            | Packet::WhoReq { header, .. }
            | Packet::WhoReply { header, .. }
            | Packet::FingerReq { header, .. }
            | Packet::FingerReply { header, .. }
            | Packet::LocateReq { header, .. }
            | Packet::LocateReply { header, .. }
            | Packet::Mudlist { header, .. }
            | Packet::StartupReq3 { header, .. }
            | Packet::StartupReply { header, .. }
            | Packet::Error { header, .. }
            | Packet::Opaque { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut PacketHeader {
        match self {
            Packet::Tell { header, .. }
            | Packet::Emoteto { header, .. }
            | Packet::ChannelMessage { header, .. }
            | Packet::ChannelEmote { header, .. }
            | Packet::ChannelTarget { header, .. }
            | Packet::ChannelAdd { header, .. }
            | Packet::ChannelRemove { header, .. }
            | Packet::ChannelAdmin { header, .. }
            | Packet::ChanlistReply { header, .. }
            | Packet::ChannelListen { header, .. }
            | Packet::ChannelWhoReq { header, .. }
            | Packet::ChannelWhoReply { header, .. }
            | Packet::WhoReq { header, .. }
            | Packet::WhoReply { header, .. }
            | Packet::FingerReq { header, .. }
            | Packet::FingerReply { header, .. }
            | Packet::LocateReq { header, .. }
            | Packet::LocateReply { header, .. }
            | Packet::Mudlist { header, .. }
            | Packet::StartupReq3 { header, .. }
            | Packet::StartupReply { header, .. }
            | Packet::Error { header, .. }
            | Packet::Opaque { header, .. } => header,
        }
    }

    /// Build an error reply for a failed packet, carrying the original
    /// under bad_packet and addressed back at its originator.
    pub fn error_reply(
        failed: &Packet,
        our_mud: &str,
        error_code: &str,
        error_message: &str,
    ) -> Packet {
        Packet::Error {
            header: failed.header().reply_to(our_mud),
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
            bad_packet: Some(Box::new(failed.to_lpc())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::lpc::LpcCodec;

    fn header() -> PacketHeader {
        PacketHeader::new(200, "RemoteMUD", "sender", "TestMUD", "receiver")
    }

    fn roundtrip(packet: Packet) {
        let wire = LpcCodec::encode(&packet.to_lpc());
        let decoded = Packet::from_lpc(LpcCodec::decode(&wire).unwrap()).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_tell_roundtrip() {
        roundtrip(Packet::Tell {
            header: header(),
            visname: "Sender".to_string(),
            message: "Hello there!".to_string(),
        });
    }

    #[test]
    fn test_emoteto_roundtrip() {
        roundtrip(Packet::Emoteto {
            header: header(),
            visname: "Sender".to_string(),
            message: "waves happily.".to_string(),
        });
    }

    #[test]
    fn test_channel_message_roundtrip() {
        roundtrip(Packet::ChannelMessage {
            header: PacketHeader::new(200, "RemoteMUD", "sender", BROADCAST, ""),
            channel: "intergossip".to_string(),
            visname: "Sender".to_string(),
            message: "anyone around?".to_string(),
        });
    }

    #[test]
    fn test_who_roundtrip() {
        roundtrip(Packet::WhoReq {
            header: header(),
            filter: vec![(LpcValue::string("level_min"), LpcValue::Int(10))],
        });
        roundtrip(Packet::WhoReply {
            header: header(),
            who_data: vec![LpcValue::Mapping(vec![
                (LpcValue::string("name"), LpcValue::string("Alice")),
                (LpcValue::string("idle"), LpcValue::Int(30)),
                (LpcValue::string("level"), LpcValue::Int(45)),
            ])],
        });
    }

    #[test]
    fn test_locate_roundtrip() {
        roundtrip(Packet::LocateReq {
            header: PacketHeader::new(200, "RemoteMUD", "requester", BROADCAST, ""),
            user_to_locate: "ghost".to_string(),
        });
        roundtrip(Packet::LocateReply {
            header: header(),
            located_mud: "TestMUD".to_string(),
            located_user: "ghost".to_string(),
            idle_time: 12,
            status_string: "idling".to_string(),
        });
    }

    #[test]
    fn test_mudlist_roundtrip() {
        roundtrip(Packet::Mudlist {
            header: PacketHeader::new(200, "*i3", "", "TestMUD", ""),
            mudlist_id: 1234,
            muds: vec![(
                "OtherMud".to_string(),
                LpcValue::Array(vec![
                    LpcValue::string("10.0.0.1"),
                    LpcValue::Int(4000),
                    LpcValue::Int(4001),
                    LpcValue::Int(0),
                ]),
            )],
        });
    }

    #[test]
    fn test_startup_req_roundtrip() {
        roundtrip(Packet::StartupReq3 {
            header: PacketHeader::new(200, "TestMUD", "", "*i3", ""),
            password: 0,
            old_mudlist_id: 5,
            old_chanlist_id: 7,
            player_port: 4000,
            tcp_port: 4001,
            udp_port: 0,
            mudlib: "TestLib".to_string(),
            base_mudlib: "LPMud".to_string(),
            driver: "Custom".to_string(),
            mud_type: "LP".to_string(),
            open_status: "open".to_string(),
            admin_email: "admin@test.mud".to_string(),
            services: vec![(LpcValue::string("tell"), LpcValue::Int(1))],
            other_data: LpcValue::Int(0),
        });
    }

    #[test]
    fn test_startup_reply_roundtrip() {
        roundtrip(Packet::StartupReply {
            header: PacketHeader::new(200, "*i3", "", "TestMUD", ""),
            router_list: vec![("*i3".to_string(), "204.209.44.3 8080".to_string())],
            password: 12345,
        });
    }

    #[test]
    fn test_chanlist_reply_roundtrip() {
        roundtrip(Packet::ChanlistReply {
            header: PacketHeader::new(200, "*i3", "", "TestMUD", ""),
            chanlist_id: 42,
            channels: vec![
                ChanlistEntry {
                    name: "intergossip".to_string(),
                    info: Some(("*i3".to_string(), 0)),
                },
                ChanlistEntry {
                    name: "dead-channel".to_string(),
                    info: None,
                },
            ],
        });
    }

    #[test]
    fn test_error_roundtrip() {
        let failed = Packet::Tell {
            header: header(),
            visname: "Sender".to_string(),
            message: "hi".to_string(),
        };
        roundtrip(Packet::error_reply(&failed, "TestMUD", "unk-user", "receiver not online"));
    }

    #[test]
    fn test_error_reply_addressing() {
        let failed = Packet::Tell {
            header: header(),
            visname: String::new(),
            message: "hi".to_string(),
        };
        let reply = Packet::error_reply(&failed, "TestMUD", "unk-user", "no such user");
        let reply_header = reply.header();
        assert_eq!(reply_header.originator_mud, "TestMUD");
        assert_eq!(reply_header.target_mud, "RemoteMUD");
        assert_eq!(reply_header.target_user, "sender");
        match reply {
            Packet::Error { bad_packet, .. } => assert!(bad_packet.is_some()),
            _ => panic!("expected error packet"),
        }
    }

    #[test]
    fn test_unknown_tag_becomes_opaque() {
        let wire = LpcValue::Array(vec![
            LpcValue::string("oob-req"),
            LpcValue::Int(5),
            LpcValue::string("MudA"),
            LpcValue::Int(0),
            LpcValue::string("MudB"),
            LpcValue::Int(0),
            LpcValue::string("extra"),
            LpcValue::Int(99),
        ]);
        let packet = Packet::from_lpc(wire.clone()).unwrap();
        match &packet {
            Packet::Opaque { tag, payload, .. } => {
                assert_eq!(tag, "oob-req");
                assert_eq!(payload.len(), 2);
            }
            other => panic!("expected opaque, got {:?}", other),
        }
        // Forwarding re-emits the original payload
        assert_eq!(packet.to_lpc(), wire);
    }

    #[test]
    fn test_integer_zero_target_is_broadcast() {
        let wire = LpcValue::Array(vec![
            LpcValue::string("channel-m"),
            LpcValue::Int(200),
            LpcValue::string("MudA"),
            LpcValue::string("alice"),
            LpcValue::Int(0),
            LpcValue::Int(0),
            LpcValue::string("chat"),
            LpcValue::string("Alice"),
            LpcValue::string("hi all"),
        ]);
        let packet = Packet::from_lpc(wire).unwrap();
        assert!(packet.header().is_broadcast());
        assert_eq!(packet.header().target_mud, BROADCAST);
    }

    #[test]
    fn test_short_array_rejected() {
        let wire = LpcValue::Array(vec![LpcValue::string("tell"), LpcValue::Int(5)]);
        assert!(Packet::from_lpc(wire).is_err());
    }

    #[test]
    fn test_non_array_rejected() {
        assert!(Packet::from_lpc(LpcValue::string("tell")).is_err());
    }

    #[test]
    fn test_tag_mapping_is_exhaustive() {
        for ptype in [
            PacketType::Tell,
            PacketType::Emoteto,
            PacketType::ChannelM,
            PacketType::ChannelE,
            PacketType::ChannelT,
            PacketType::ChannelAdd,
            PacketType::ChannelRemove,
            PacketType::ChannelAdmin,
            PacketType::ChanlistReply,
            PacketType::ChannelListen,
            PacketType::ChannelWhoReq,
            PacketType::ChannelWhoReply,
            PacketType::WhoReq,
            PacketType::WhoReply,
            PacketType::FingerReq,
            PacketType::FingerReply,
            PacketType::LocateReq,
            PacketType::LocateReply,
            PacketType::Mudlist,
            PacketType::StartupReq3,
            PacketType::StartupReply,
            PacketType::Error,
        ] {
            assert_eq!(PacketType::from_tag(ptype.as_str()), Some(ptype));
        }
        assert_eq!(PacketType::from_tag("nonsense"), None);
    }
}
