use super::TransformError;
use crate::data_tree::Value;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

fn split_mask(s: &str) -> (&str, Option<u8>) {
	match s.split_once('/') {
		Some((addr, mask)) => (addr, mask.parse::<u8>().ok()),
		None => (s, None),
	}
}

fn value_error(name: &str, input: &str, message: &str) -> TransformError {
	TransformError::ValueError {
		name: name.to_string(),
		input: input.to_string(),
		message: message.to_string(),
	}
}

/// `ipv4_address.normalize`: canonical dotted-quad, `/n` preserved when
/// present. Fails on non-IPv4 input.
pub fn ipv4_normalize(value: Value, _args: &[Value]) -> Result<Value, TransformError> {
	const NAME: &str = "ipv4_address.normalize";
	let s = value
		.as_scalar_string()
		.ok_or_else(|| TransformError::NonScalarInput(NAME.to_string()))?;
	let (addr_part, mask) = split_mask(&s);
	let addr: Ipv4Addr = addr_part
		.parse()
		.map_err(|_| value_error(NAME, &s, "not a valid IPv4 address"))?;
	Ok(Value::String(match mask {
		Some(m) => format!("{}/{}", addr, m),
		None => addr.to_string(),
	}))
}

/// `ip_address.normalize`: accepts IPv4 or IPv6, `/n` preserved when present.
pub fn normalize(value: Value, _args: &[Value]) -> Result<Value, TransformError> {
	const NAME: &str = "ip_address.normalize";
	let s = value
		.as_scalar_string()
		.ok_or_else(|| TransformError::NonScalarInput(NAME.to_string()))?;
	let (addr_part, mask) = split_mask(&s);
	let addr: IpAddr = addr_part
		.parse()
		.map_err(|_| value_error(NAME, &s, "not a valid IP address"))?;
	Ok(Value::String(match mask {
		Some(m) => format!("{}/{}", addr, m),
		None => addr.to_string(),
	}))
}

fn v4_network(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
	let mask = if prefix == 0 {
		0u32
	} else {
		u32::MAX << (32 - prefix)
	};
	Ipv4Addr::from(u32::from(addr) & mask)
}

fn v6_network(addr: Ipv6Addr, prefix: u8) -> Ipv6Addr {
	let mask = if prefix == 0 {
		0u128
	} else {
		u128::MAX << (128 - prefix)
	};
	Ipv6Addr::from(u128::from(addr) & mask)
}

/// `ip_address.network`: extract the network portion given the mask
/// carried in the input (`addr/prefix`); requires a mask to be present.
pub fn network(value: Value, _args: &[Value]) -> Result<Value, TransformError> {
	const NAME: &str = "ip_address.network";
	let s = value
		.as_scalar_string()
		.ok_or_else(|| TransformError::NonScalarInput(NAME.to_string()))?;
	let (addr_part, mask) = split_mask(&s);
	let prefix = mask.ok_or_else(|| value_error(NAME, &s, "no /n mask present"))?;
	let addr: IpAddr = addr_part
		.parse()
		.map_err(|_| value_error(NAME, &s, "not a valid IP address"))?;
	let network = match addr {
		IpAddr::V4(a) => IpAddr::V4(v4_network(a, prefix)),
		IpAddr::V6(a) => IpAddr::V6(v6_network(a, prefix)),
	};
	Ok(Value::String(format!("{}/{}", network, prefix)))
}

/// `ip_address.host`: the host address without its mask suffix.
pub fn host(value: Value, _args: &[Value]) -> Result<Value, TransformError> {
	const NAME: &str = "ip_address.host";
	let s = value
		.as_scalar_string()
		.ok_or_else(|| TransformError::NonScalarInput(NAME.to_string()))?;
	let (addr_part, _mask) = split_mask(&s);
	let addr: IpAddr = addr_part
		.parse()
		.map_err(|_| value_error(NAME, &s, "not a valid IP address"))?;
	Ok(Value::String(addr.to_string()))
}

/// Membership test used by the system matcher for `@key op cidr` subnet
/// comparisons.
pub fn subnet_contains(cidr: &str, candidate: &str) -> bool {
	let (net_part, Some(prefix)) = split_mask(cidr) else {
		return false;
	};
	let (candidate_addr, _) = split_mask(candidate);
	match (net_part.parse::<IpAddr>(), candidate_addr.parse::<IpAddr>()) {
		(Ok(IpAddr::V4(net)), Ok(IpAddr::V4(cand))) => v4_network(net, prefix) == v4_network(cand, prefix),
		(Ok(IpAddr::V6(net)), Ok(IpAddr::V6(cand))) => v6_network(net, prefix) == v6_network(cand, prefix),
		_ => false,
	}
}
