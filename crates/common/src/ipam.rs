/// 子网地址计算
///
/// 不维护租约表：空闲地址每次都由当前虚拟机记录中已使用的地址集合推算。
/// 每个子网的第一个地址为网络地址，第二个地址保留为网关。

use std::collections::HashSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// 解析后的子网
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    /// 网络地址
    pub network: u32,
    /// 网络地址之后的第一个地址（保留为网关）
    pub first_usable: i64,
    /// 广播地址之前的最后一个地址，/31 与 /32 时可能小于 `first_usable`
    pub last_usable: i64,
    pub prefix_len: u8,
}

impl Subnet {
    /// 可分配给虚拟机的地址（跳过网关），惰性迭代
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        (self.first_usable + 1..=self.last_usable).map(|ip| Ipv4Addr::from(ip as u32))
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.first_usable as u32)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.prefix_len))
    }

    /// 是否为可分配给虚拟机的地址，即属于 `hosts()`
    pub fn is_assignable(&self, ip: Ipv4Addr) -> bool {
        let value = u32::from(ip) as i64;
        value > self.first_usable && value <= self.last_usable
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & prefix_mask(self.prefix_len) == self.network
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix_len)
    }
}

/// 一次分配得到的地址信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

fn prefix_mask(prefix_len: u8) -> u32 {
    u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0)
}

/// 拆分 "a.b.c.d/n"，不做掩码运算
pub fn split_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .trim()
        .split_once('/')
        .ok_or_else(|| Error::InvalidCidr(format!("缺少前缀长度: {}", cidr)))?;

    let ip: Ipv4Addr = addr
        .trim()
        .parse()
        .map_err(|_| Error::InvalidCidr(format!("无效的地址: {}", cidr)))?;
    let prefix_len: u8 = prefix
        .trim()
        .parse()
        .map_err(|_| Error::InvalidCidr(format!("无效的前缀长度: {}", cidr)))?;

    if prefix_len > 32 {
        return Err(Error::InvalidCidr(format!("前缀长度超出范围 [0,32]: {}", cidr)));
    }

    Ok((ip, prefix_len))
}

/// 解析子网，返回网络地址与可用范围
pub fn parse_subnet(cidr: &str) -> Result<Subnet> {
    let (ip, prefix_len) = split_cidr(cidr)?;
    let network = u32::from(ip) & prefix_mask(prefix_len);
    let size = 1i64 << (32 - prefix_len as u32);

    Ok(Subnet {
        network,
        first_usable: network as i64 + 1,
        last_usable: network as i64 + size - 2,
        prefix_len,
    })
}

/// 子网内可分配地址序列（不含网络地址、网关和广播地址）
pub fn expand_range(cidr: &str) -> Result<impl Iterator<Item = Ipv4Addr>> {
    Ok(parse_subnet(cidr)?.hosts())
}

pub fn gateway_of(cidr: &str) -> Result<Ipv4Addr> {
    Ok(parse_subnet(cidr)?.gateway())
}

pub fn netmask_of(cidr: &str) -> Result<Ipv4Addr> {
    Ok(parse_subnet(cidr)?.netmask())
}

/// "ip/prefix" 所在网络的规范 CIDR 表示
pub fn subnet_of(ip_with_cidr: &str) -> Result<String> {
    Ok(parse_subnet(ip_with_cidr)?.to_string())
}

/// 数值最小的空闲地址
pub fn first_free(cidr: &str, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
    expand_range(cidr)?
        .find(|ip| !used.contains(ip))
        .ok_or_else(|| Error::AddressPoolExhausted(cidr.trim().to_string()))
}

/// 全部空闲地址，升序
pub fn all_free(cidr: &str, used: &HashSet<Ipv4Addr>) -> Result<Vec<Ipv4Addr>> {
    Ok(expand_range(cidr)?.filter(|ip| !used.contains(ip)).collect())
}

/// 将记录中的地址字段收集为已用集合，忽略空值与无法解析的值
pub fn used_set<I, S>(addresses: I) -> HashSet<Ipv4Addr>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    addresses
        .into_iter()
        .filter_map(|addr| addr.as_ref().trim().parse().ok())
        .collect()
}

/// 由用户给定的静态 "ip/prefix" 推导地址信息
///
/// 网络地址、网关与广播地址不能作为虚拟机地址。
pub fn static_addressing(cidr: &str) -> Result<Addressing> {
    let (ip, _) = split_cidr(cidr)?;
    let subnet = parse_subnet(cidr)?;
    if !subnet.is_assignable(ip) {
        return Err(Error::InvalidCidr(format!(
            "{} 不是子网 {} 中可分配的地址",
            ip, subnet
        )));
    }

    Ok(Addressing {
        ip,
        gateway: subnet.gateway(),
        netmask: subnet.netmask(),
    })
}

/// 在子网中按已用集合分配第一个空闲地址
pub fn allocate(cidr: &str, used: &HashSet<Ipv4Addr>) -> Result<Addressing> {
    let subnet = parse_subnet(cidr)?;
    let ip = first_free(cidr, used)?;

    Ok(Addressing {
        ip,
        gateway: subnet.gateway(),
        netmask: subnet.netmask(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_subnet() {
        let subnet = parse_subnet("10.0.0.0/24").unwrap();
        assert_eq!(Ipv4Addr::from(subnet.network), ip("10.0.0.0"));
        assert_eq!(subnet.first_usable, u32::from(ip("10.0.0.1")) as i64);
        assert_eq!(subnet.last_usable, u32::from(ip("10.0.0.254")) as i64);
        assert_eq!(subnet.prefix_len, 24);
    }

    #[test]
    fn test_parse_subnet_rejects_malformed_input() {
        for bad in ["10.0.0.0", "10.0.0/24", "10.0.0.0/33", "10.0.0.0/x", "", "/24"] {
            assert!(matches!(parse_subnet(bad), Err(Error::InvalidCidr(_))), "{}", bad);
        }
    }

    #[test]
    fn test_expand_range_excludes_reserved_addresses() {
        let hosts: Vec<Ipv4Addr> = expand_range("192.168.1.0/29").unwrap().collect();
        assert_eq!(
            hosts,
            vec![
                ip("192.168.1.2"),
                ip("192.168.1.3"),
                ip("192.168.1.4"),
                ip("192.168.1.5"),
                ip("192.168.1.6"),
            ]
        );
    }

    #[test]
    fn test_expand_range_size() {
        for prefix in [16u32, 20, 24, 28, 30] {
            let count = expand_range(&format!("172.16.0.0/{}", prefix)).unwrap().count();
            assert_eq!(count, (1usize << (32 - prefix)) - 3, "/{}", prefix);
        }
        assert_eq!(expand_range("10.0.0.0/31").unwrap().count(), 0);
        assert_eq!(expand_range("10.0.0.0/32").unwrap().count(), 0);
        assert_eq!(expand_range("0.0.0.0/32").unwrap().count(), 0);
    }

    #[test]
    fn test_expand_range_is_lazy_for_large_networks() {
        let first: Vec<Ipv4Addr> = expand_range("0.0.0.0/0").unwrap().take(2).collect();
        assert_eq!(first, vec![ip("0.0.0.2"), ip("0.0.0.3")]);
    }

    #[test]
    fn test_derivations() {
        assert_eq!(subnet_of("10.0.0.5/24").unwrap(), "10.0.0.0/24");
        assert_eq!(gateway_of("10.0.0.0/24").unwrap(), ip("10.0.0.1"));
        assert_eq!(netmask_of("10.0.0.0/24").unwrap(), ip("255.255.255.0"));
        assert_eq!(netmask_of("10.0.0.0/0").unwrap(), ip("0.0.0.0"));
        assert_eq!(netmask_of("10.0.0.0/32").unwrap(), ip("255.255.255.255"));
        assert_eq!(subnet_of("172.16.5.77/20").unwrap(), "172.16.0.0/20");
    }

    #[test]
    fn test_first_free() {
        let used = used_set(["10.0.0.2", "10.0.0.3", "10.0.0.5", ""]);
        assert_eq!(first_free("10.0.0.0/24", &used).unwrap(), ip("10.0.0.4"));
        assert_eq!(first_free("10.0.0.0/24", &HashSet::new()).unwrap(), ip("10.0.0.2"));
    }

    #[test]
    fn test_first_free_is_numeric_not_lexicographic() {
        let used: HashSet<Ipv4Addr> = (2..=9).map(|i| ip(&format!("10.0.0.{}", i))).collect();
        assert_eq!(first_free("10.0.0.0/24", &used).unwrap(), ip("10.0.0.10"));
    }

    #[test]
    fn test_first_free_exhausted() {
        let used = used_set(["10.0.0.2"]);
        assert!(matches!(
            first_free("10.0.0.0/30", &used),
            Err(Error::AddressPoolExhausted(_))
        ));
    }

    #[test]
    fn test_all_free() {
        let used = used_set(["192.168.1.3", "192.168.1.5"]);
        assert_eq!(
            all_free("192.168.1.0/29", &used).unwrap(),
            vec![ip("192.168.1.2"), ip("192.168.1.4"), ip("192.168.1.6")]
        );
    }

    #[test]
    fn test_static_addressing() {
        let addressing = static_addressing("10.1.2.50/16").unwrap();
        assert_eq!(addressing.ip, ip("10.1.2.50"));
        assert_eq!(addressing.gateway, ip("10.1.0.1"));
        assert_eq!(addressing.netmask, ip("255.255.0.0"));
    }

    #[test]
    fn test_static_addressing_rejects_reserved_addresses() {
        for cidr in ["10.0.0.0/24", "10.0.0.1/24", "10.0.0.255/24", "10.0.0.9/32"] {
            assert!(
                matches!(static_addressing(cidr), Err(Error::InvalidCidr(_))),
                "{} 应被拒绝",
                cidr
            );
        }
        assert!(static_addressing("10.0.0.2/24").is_ok());
        assert!(static_addressing("10.0.0.254/24").is_ok());
    }
}
