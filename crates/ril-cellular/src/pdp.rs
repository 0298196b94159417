//! PDP types and the bearer parameter records handed to applications.

use std::net::Ipv4Addr;

use serde::Serialize;

use crate::ril::DataCallResponse;

pub const DEFAULT_MTU: i32 = 1500;
pub const HOST_NETMASK: &str = "255.255.255.255";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum PdpType {
    /// Let the network pick.
    #[default]
    Default,
    Ipv4,
    Ipv6,
    Ipv4v6,
    NonIp,
}

impl PdpType {
    pub fn as_ril_str(self) -> &'static str {
        match self {
            PdpType::Default => "",
            PdpType::Ipv4 => "IP",
            PdpType::Ipv6 => "IPV6",
            PdpType::Ipv4v6 => "IPV4V6",
            PdpType::NonIp => "Non-IP",
        }
    }

    pub fn from_ril_str(s: &str) -> Option<Self> {
        match s {
            "" => Some(PdpType::Default),
            "IP" => Some(PdpType::Ipv4),
            "IPV6" => Some(PdpType::Ipv6),
            "IPV4V6" => Some(PdpType::Ipv4v6),
            "Non-IP" => Some(PdpType::NonIp),
            _ => None,
        }
    }
}

/// One bearer as reported by the radio. Fields the radio does not provide
/// stay at -1 or the empty string. A reported MTU of 0 means 1500.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PdpContextParams {
    pub apn: String,
    pub local_addr: String,
    pub local_subnet_mask: String,
    pub gateway_addr: String,
    pub dns_primary_addr: String,
    pub dns_secondary_addr: String,
    pub p_cscf_prim_addr: String,
    pub p_cscf_sec_addr: String,
    pub cid: i32,
    pub bearer_id: i32,
    pub im_signalling_flag: i32,
    pub lipa_indication: i32,
    pub ipv4_mtu: i32,
    pub wlan_offload: i32,
    pub local_addr_ind: i32,
    pub non_ip_mtu: i32,
    pub serving_plmn_rate_control_value: i32,
}

impl Default for PdpContextParams {
    fn default() -> Self {
        Self {
            apn: String::new(),
            local_addr: String::new(),
            local_subnet_mask: HOST_NETMASK.to_string(),
            gateway_addr: String::new(),
            dns_primary_addr: String::new(),
            dns_secondary_addr: String::new(),
            p_cscf_prim_addr: String::new(),
            p_cscf_sec_addr: String::new(),
            cid: -1,
            bearer_id: -1,
            im_signalling_flag: -1,
            lipa_indication: -1,
            ipv4_mtu: -1,
            wlan_offload: -1,
            local_addr_ind: -1,
            non_ip_mtu: -1,
            serving_plmn_rate_control_value: -1,
        }
    }
}

impl PdpContextParams {
    pub fn from_data_call(apn: &str, call: &DataCallResponse) -> Self {
        let (local_addr, local_subnet_mask) = match call.addresses.split_whitespace().next() {
            Some(addr) => split_address(addr),
            None => (String::new(), HOST_NETMASK.to_string()),
        };
        let mut dns = call.dnses.split_whitespace();
        let mut pcscf = call.pcscf.split_whitespace();
        Self {
            apn: apn.to_string(),
            local_addr,
            local_subnet_mask,
            gateway_addr: first_word(&call.gateways),
            dns_primary_addr: dns.next().unwrap_or_default().to_string(),
            dns_secondary_addr: dns.next().unwrap_or_default().to_string(),
            p_cscf_prim_addr: pcscf.next().unwrap_or_default().to_string(),
            p_cscf_sec_addr: pcscf.next().unwrap_or_default().to_string(),
            cid: call.cid,
            bearer_id: call.cid,
            ipv4_mtu: if call.mtu > 0 { call.mtu } else { DEFAULT_MTU },
            ..Self::default()
        }
    }
}

pub(crate) fn first_word(s: &str) -> String {
    s.split_whitespace().next().unwrap_or_default().to_string()
}

/// `"10.0.0.1/24"` → (`"10.0.0.1"`, `"255.255.255.0"`). Anything without a
/// usable IPv4 prefix keeps the host mask.
pub(crate) fn split_address(addr: &str) -> (String, String) {
    match addr.split_once('/') {
        Some((ip, prefix)) => {
            let mask = match (ip.parse::<Ipv4Addr>(), prefix.parse::<u32>()) {
                (Ok(_), Ok(bits)) if bits <= 32 => prefix_to_netmask(bits),
                _ => HOST_NETMASK.to_string(),
            };
            (ip.to_string(), mask)
        }
        None => (addr.to_string(), HOST_NETMASK.to_string()),
    }
}

fn prefix_to_netmask(bits: u32) -> String {
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    Ipv4Addr::from(mask).to_string()
}
